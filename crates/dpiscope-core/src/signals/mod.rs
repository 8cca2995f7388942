//! Time-windowed facts about hosts
//!
//! Facts come from two places: host-test results handed in by the caller,
//! and the wire inspectors' current view of the host's address. The
//! [`SignalsAdapter`] writes both into a [`SignalStore`] and aggregates them
//! back into a [`BlockageSignals`] snapshot for the diagnosis engine.

mod adapter;
mod blockage;
mod event;
mod host_tested;
mod snapshot;
mod store;

pub use adapter::SignalsAdapter;
pub use blockage::{BlockageCode, DnsStatus, UnknownCode};
pub use event::{SignalEvent, SignalType, SignalValue};
pub use host_tested::{HostTested, Http3Status, TestTransport};
pub use snapshot::{is_fake_ip, BlockageSignals};
pub use store::{SignalSequence, SignalStore};
