//! laundry: allocation engine for a shared pool of washing machines.

mod version;

pub mod clock;
pub mod config;
pub mod machine;
pub mod monitor;
pub mod notification;
pub mod pool;
pub mod reservation;
pub mod service;
pub mod store;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, PoolConfig};
pub use machine::{Machine, MachineId, MachineState, MachineStatus, Usage};
pub use monitor::StatusMonitor;
pub use notification::{Notification, NotificationCenter, NotificationId};
pub use pool::{Allocation, PoolError, Release, ResourcePool};
pub use reservation::{Reservation, ReservationId, ReservationQueue};
pub use service::{ActionResult, HealthSnapshot, LaundryService, StatusSnapshot};
pub use store::{MemoryStore, SqliteStore, Store, StoreError};
pub use version::{LAUNDRY_VERSION, VersionInfo};
