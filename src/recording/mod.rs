pub mod clock;
pub mod live;
pub mod pipeline;
pub mod registry;
pub mod state;
pub mod throttle;

pub use clock::{Clock, ManualClock, SystemClock};
pub use live::LiveValueCache;
pub use pipeline::{IngestPipeline, PersistenceWorker};
pub use registry::SessionRegistry;
pub use state::{SessionSlot, SlotState};
pub use throttle::Throttle;
