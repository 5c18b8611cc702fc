//! Policy engine: typed values, models, providers and the manager that
//! reconciles administrators' votes.

pub mod error;
pub mod manager;
pub mod model;
pub mod provider;
pub mod sqlite;
pub mod store;
pub mod value;

pub use error::{PluginError, PolicyError};
pub use manager::{CHANGED_SIGNAL, PolicyManager};
pub use model::{PolicyModel, default_comparator};
pub use provider::{
    DirectoryLoader, LoadedProvider, PluginLibrary, PolicyProvider, ProviderLoader, StaticLoader,
};
pub use sqlite::SqliteStore;
pub use store::{Admin, MemoryStore, PolicyManaged, PolicyStore, StoreError};
pub use value::{CodecError, PolicyValue, Stringify, ValueType};
