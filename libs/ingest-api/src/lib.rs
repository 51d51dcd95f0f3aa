pub mod clock;
pub mod error;
pub mod metrics;
pub mod object;
pub mod processor;
pub mod queue;
pub mod record;
pub mod store;
pub mod stream;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorKind, PluginError};
pub use record::{Batch, BatchSource, FlushReason, Record};
