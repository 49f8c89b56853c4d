//! Domain layer of the nimbus gateway: core types, the trait seams to the
//! cloud platform and the UI, and the services that coordinate them.
//!
//! Infrastructure crates (`nimbus-cloud`, `nimbus-store`, `nimbus-ui`)
//! implement the traits; the binary wires everything together.

pub mod error;
pub mod history;
pub mod registry;
pub mod resolver;
pub mod router;
pub mod traits;
pub mod types;

pub use error::{DomainError, DomainResult};
pub use history::{HistoryReplayService, REPLAYED_APP_IDS};
pub use registry::{DeviceConnection, DeviceRegistry};
pub use resolver::CellLocationResolver;
pub use router::{MessageRouter, Republish};
pub use traits::{
    AccountInfo, CellLocationProvider, CloudApi, CloudLink, CloudLinkFactory, DeviceListing,
    DeviceStore, HistoricalMessage, IssuedCertificates, LinkEvent, MessagePage, UiPublisher,
};
pub use types::{
    AppTransform, CellGeolocation, CellQuery, DeviceReading, DeviceRecord, GeoFix, InboundMessage,
};
