//! Monitoring bridge: typed event protocol, broadcast bus with explicit
//! back-pressure, and the read-only HTTP/WS surface the dashboard consumes.

pub mod event_bus;
pub mod monitor;
pub mod protocol;

pub use event_bus::{EventBus, EventSubscriber};
pub use monitor::{monitor_router, MonitorState};
pub use protocol::{MonitorEnvelope, MonitorEvent};
