pub mod record;
pub mod record_db;
pub mod store;
pub mod watcher;
pub mod context;
pub mod config;
pub mod projection;
pub mod diff;
pub mod binding;
pub mod segmented;
pub mod error;

pub use binding::{
    BindingOptions, DeleteEditor, EditAction, Editor, FnEditor, ListBinding, ListControl,
    NoEditor, SnapshotModel,
};
pub use config::{parse_config, parse_config_str, StoreConfig, ViewConfig};
pub use context::{ExecutionContext, Immediate, QueueContext};
pub use diff::{compute_patch, Patch, PatchOp};
pub use error::{Result, SectionDbError};
pub use projection::{
    compile_view, CompiledView, IndexPath, RecomputePolicy, Search, SearchIndex, Section,
    Snapshot, ViewDefinition,
};
pub use record::{CompositeKey, Encoding, Identifiable, Item, KeyStrategy, Persistable};
pub use segmented::SegmentedBinding;
pub use store::{ChangeSet, ReadTransaction, Store, SubscriptionId, WriteTransaction};
