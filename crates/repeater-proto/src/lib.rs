//! Shared wire definitions for controller ↔ repeater communication.
//! Kept in a dedicated crate so the controller side and test fixtures can
//! speak the same frames without pulling in executors or the tokio stack.

mod discovery;
mod error_code;
mod events;
mod message;

pub use discovery::{DiscoveryStatus, DiscoveryView};
pub use error_code::ErrorCode;
pub use events::{
    DeployPayload, DeployedPayload, ErrorPayload, Frame, InboundEvent, NetworkTestInput,
    NetworkTestPayload, NetworkTestResult, NetworkTestType, RuntimeInfo, ScriptSource, ScriptsUpdatedPayload,
    UpdateAvailablePayload, EVENT_DEPLOY, EVENT_DEPLOYED, EVENT_ERROR, EVENT_REQUEST,
    EVENT_SCRIPTS_UPDATED, EVENT_TEST_NETWORK, EVENT_UPDATE_AVAILABLE,
};
pub use message::{BodyEncoding, HeaderValue, Headers, Protocol, Request, Response};
