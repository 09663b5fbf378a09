pub mod sleep;
pub mod ticket;

pub use self::sleep::{SleepMutex, SleepMutexGuard};
pub use self::ticket::{TicketMutex, TicketMutexGuard};
