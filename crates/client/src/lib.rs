//! REST client core for cosmosql.
//!
//! - **Signing**: master-key HMAC authorization (`auth`).
//! - **Transport**: the [`HttpSender`] seam and its reqwest implementation (`transport`).
//! - **Pipeline**: headers, retries, request charges and session tokens (`pipeline`, `session`).
//! - **Routing**: effective partition keys and the range cache (`epk`, `pkranges`).
//! - **Resources**: typed database, container, document and offer operations (`resources`).
//! - **Queries**: cross-partition execution over the SQL crate's merge plans (`executor`).
pub mod auth;
pub mod epk;
pub mod executor;
pub mod pipeline;
pub mod pkranges;
pub mod request;
pub mod resources;
pub mod session;
pub mod transport;

pub use auth::MasterKeySigner;
pub use executor::{QueryRequest, QueryStream};
pub use pkranges::{PartitionKeyRange, PartitionKeyRangeCache, RangeFetcher, RoutingMap};
pub use request::{RequestOptions, RequestSpec, ResourceType};
pub use resources::{
    ContainerProperties, CosmosClient, DatabaseProperties, DocumentOptions, FeedPager, Offer,
    ResourceResponse,
};
pub use transport::{HttpRequest, HttpResponse, HttpSender, ReqwestSender};
