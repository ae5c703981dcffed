//! Shared LizardFS entity types.
//!
//! Everything the wire protocol, the client data plane and the master agree
//! on lives here: the redundancy model (slice and part types, goals, media
//! labels, the copies calculator), both ACL forms, file lock descriptions
//! and the status code table.

mod slice;
pub use slice::*;

mod goal;
pub use goal::*;

mod copies;
pub use copies::*;

mod acl;
pub use acl::*;

mod richacl;
pub use richacl::*;

mod locks;
pub use locks::*;

mod status;
pub use status::*;
