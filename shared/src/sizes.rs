pub const KB: usize = 1024;
