//! FUSE integration.
//!
//! The mount exposes the logical namespace from the metadata store, backed
//! by the local content cache. Remote content is fetched on demand; local
//! writes are acknowledged immediately and uploaded in the background.

mod inode_table;
mod sharebox_fs;

pub use inode_table::InodeTable;
pub use sharebox_fs::ShareBoxFs;
