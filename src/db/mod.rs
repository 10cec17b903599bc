pub mod contents;
pub mod ystore;

pub use contents::{ContentError, ContentModel, ContentStore, FsContentStore, MemoryContentStore, SaveRequest};
pub use ystore::{
    FileUpdateStoreProvider, MemoryUpdateStoreProvider, StoreError, UpdateStore, UpdateStoreProvider,
};
