//! Single-request relay core.
//!
//! One inbound call flows through these stages:
//!
//! ```text
//! normalize -> reserve quota -> adaptor request -> adaptor response (via tap)
//!                                    |                    |
//!                                    +-- failure: release reservation
//!                                                         |
//!                                   extract content (log) + settle (background)
//! ```
//!
//! [`Relay`] drives the sequence; the other modules are its collaborators.

pub mod adaptor;
pub mod billing;
pub mod extract;
pub mod ledger;
pub mod meta;
pub mod normalize;
pub mod orchestrator;
pub mod request;
pub mod settle;
pub mod stats;
pub mod tap;

pub use adaptor::{Adaptor, AdaptorRegistry, OpenAiAdaptor, ResponseOutcome, UpstreamResponse};
pub use billing::{ModelRatioProvider, PriceSnapshot, RatioTable};
pub use extract::{extract, extract_non_stream, extract_stream, Placeholder};
pub use ledger::{InMemoryLedger, LedgerEvent, QuotaLedger, QuotaReservation, Settlement};
pub use meta::{ApiType, ChannelType, RelayMeta, RelayMode};
pub use normalize::{ModelMapper, ModelMapping, NormalizedRequest, RequestNormalizer};
pub use orchestrator::{Relay, RelayPhase, RelaySummary};
pub use request::{CanonicalRequest, ContentPart, Message, MessageContent, Usage};
pub use settle::{SettlementJob, SettlementQueue};
pub use stats::{RelayStats, StatsSummary};
pub use tap::{
    response_channel, CapturedResponse, ChannelReceiver, ChannelWriter, MemoryWriter,
    ResponseHead, ResponseTap, ResponseWriter,
};
