pub mod backend;
pub mod clock;
pub mod config;
pub mod document;
pub mod errors;
pub mod filter;
pub mod guard;
pub mod metrics_defs;
pub mod object_store;
pub mod predicate;
pub mod resolver;
pub mod store;
pub mod types;
pub mod value;

pub use errors::{Result, StoreError};
pub use filter::FilterExpression;
pub use store::{ConfigStore, QueryOptions, QueryResult};
pub use types::{
    ConfigRecord, ConfigResource, ConfigResourceContext, MergedConfig, RequestContext, WriteResult,
};
