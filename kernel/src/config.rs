//! Kernel tunables, read from `key = value` lines.
//!
//! ```text
//! # small machine
//! vm.frames = 16
//! vm.paging = demand
//! ```

use core::str::FromStr;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, space0};
use nom::combinator::{all_consuming, map, rest, verify};
use nom::sequence::{delimited, separated_pair};
use nom::IResult;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("line {line}: expected `key = value`")]
    Syntax { line: usize },
    #[error("line {line}: unknown key `{key}`")]
    UnknownKey { line: usize, key: String },
    #[error("line {line}: invalid value `{value}` for `{key}`")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// What happens when the free frame pool runs dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// Evict a resident page to swap and hand out its frame.
    Demand,
    /// Every page stays resident; running out of frames is fatal.
    Resident,
}

impl FromStr for PagingMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "demand" => Ok(Self::Demand),
            "resident" => Ok(Self::Resident),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Physical frames in the machine.
    pub num_phys_pages: usize,
    /// Slots in each processor's TLB.
    pub tlb_entries: usize,
    /// Pages a process stack may grow to.
    pub stack_pages: u32,
    /// The reclaimer keeps at least this many frames free.
    pub low_water_mark: usize,
    pub swap_file: String,
    /// Victim search rounds before eviction gives up.
    pub eviction_rounds: usize,
    pub paging: PagingMode,
    pub background_reclaim: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            num_phys_pages: 32,
            tlb_entries: 4,
            stack_pages: 8,
            low_water_mark: 4,
            swap_file: "vmkern.swp".into(),
            eviction_rounds: 8,
            paging: PagingMode::Demand,
            background_reclaim: true,
        }
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '_'
}

fn key_value(input: &str) -> IResult<&str, (&str, &str)> {
    all_consuming(separated_pair(
        take_while1(is_key_char),
        delimited(space0, char('='), space0),
        map(verify(rest, |value: &str| !value.trim().is_empty()), str::trim_end),
    ))(input)
}

fn parse_value<T: FromStr>(line: usize, key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        line,
        key: key.into(),
        value: value.into(),
    })
}

impl VmConfig {
    /// Applies every setting in `text` on top of the defaults and validates
    /// the result.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.split('#').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }
            let (_, (key, value)) =
                key_value(content).map_err(|_| ConfigError::Syntax { line })?;
            config.set(line, key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn set(&mut self, line: usize, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "vm.frames" => self.num_phys_pages = parse_value(line, key, value)?,
            "vm.tlb_entries" => self.tlb_entries = parse_value(line, key, value)?,
            "vm.stack_pages" => self.stack_pages = parse_value(line, key, value)?,
            "vm.low_water_mark" => self.low_water_mark = parse_value(line, key, value)?,
            "vm.swap_file" => self.swap_file = value.into(),
            "vm.eviction_rounds" => self.eviction_rounds = parse_value(line, key, value)?,
            "vm.paging" => self.paging = parse_value(line, key, value)?,
            "vm.background_reclaim" => self.background_reclaim = parse_value(line, key, value)?,
            _ => {
                return Err(ConfigError::UnknownKey {
                    line,
                    key: key.into(),
                })
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_phys_pages == 0 {
            return Err(ConfigError::Invalid("the machine needs at least one frame"));
        }
        if self.tlb_entries == 0 {
            return Err(ConfigError::Invalid("the TLB needs at least one slot"));
        }
        if self.eviction_rounds == 0 {
            return Err(ConfigError::Invalid("eviction needs at least one round"));
        }
        if self.low_water_mark >= self.num_phys_pages {
            return Err(ConfigError::Invalid(
                "low water mark must be below the frame count",
            ));
        }
        if self.swap_file.is_empty() {
            return Err(ConfigError::Invalid("swap file name is empty"));
        }
        Ok(())
    }
}

impl FromStr for VmConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_gives_defaults() {
        assert_eq!(VmConfig::parse("").unwrap(), VmConfig::default());
        assert_eq!(
            VmConfig::parse("# nothing here\n\n   \n").unwrap(),
            VmConfig::default()
        );
    }

    #[test]
    fn every_key() {
        let config: VmConfig = "
            vm.frames = 64
            vm.tlb_entries=8
            vm.stack_pages = 2   # tiny stacks
            vm.low_water_mark = 0
            vm.swap_file = pages.swp
            vm.eviction_rounds = 3
            vm.paging = resident
            vm.background_reclaim = false
        "
        .parse()
        .unwrap();
        assert_eq!(
            config,
            VmConfig {
                num_phys_pages: 64,
                tlb_entries: 8,
                stack_pages: 2,
                low_water_mark: 0,
                swap_file: "pages.swp".into(),
                eviction_rounds: 3,
                paging: PagingMode::Resident,
                background_reclaim: false,
            }
        );
    }

    #[test]
    fn errors_carry_line_numbers() {
        assert_eq!(
            VmConfig::parse("vm.frames = 8\nvm.frames 9"),
            Err(ConfigError::Syntax { line: 2 })
        );
        assert_eq!(
            VmConfig::parse("\nvm.colour = blue"),
            Err(ConfigError::UnknownKey {
                line: 2,
                key: "vm.colour".into()
            })
        );
        assert_eq!(
            VmConfig::parse("vm.paging = lazy"),
            Err(ConfigError::InvalidValue {
                line: 1,
                key: "vm.paging".into(),
                value: "lazy".into()
            })
        );
        assert_eq!(
            VmConfig::parse("vm.frames ="),
            Err(ConfigError::Syntax { line: 1 })
        );
    }

    #[test]
    fn validation() {
        assert!(matches!(
            VmConfig::parse("vm.frames = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            VmConfig::parse("vm.frames = 4\nvm.low_water_mark = 4"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            VmConfig::parse("vm.tlb_entries = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            VmConfig::parse("vm.eviction_rounds = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }
}
