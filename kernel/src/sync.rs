pub mod condvar;
pub mod intr;
pub mod mutex;

pub use condvar::Condvar;
pub use mutex::{SleepMutex, SleepMutexGuard, TicketMutex, TicketMutexGuard};
