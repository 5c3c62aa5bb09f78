pub mod attachment;
pub mod credentials;
pub mod error;
pub mod fingerprint;
pub mod naming;
pub mod transport;
pub mod volume;
pub mod volume_context;

pub use attachment::{MountpointAttachment, MountpointAttachmentSpec, WorkloadAttachment};
pub use credentials::CredentialBundle;
pub use error::DriverError;
pub use fingerprint::Fingerprint;
pub use transport::{OptionsFrame, RedactedFrame};
pub use volume::VolumeId;
pub use volume_context::{AuthenticationSource, VolumeContext};
