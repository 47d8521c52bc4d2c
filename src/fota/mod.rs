// Firmware update of the Wi-Fi co-processor over HTTP

pub mod error;
pub mod events;
pub mod orchestrator;
pub mod params;
pub mod ports;
pub mod reassembly;
pub mod timer;
pub mod transfer;

pub use error::FotaError;
pub use events::{EventBits, EventGroup};
pub use orchestrator::{Fota, FotaCollaborators, FotaState, HostCallback};
pub use params::{FotaParameters, MAX_SERVER_NAME_LEN, MAX_URI_LEN};
pub use ports::{
    AddressResolver, DeviceUpdateChannel, HttpMethod, HttpRequest, HttpTransfer, SharedDevice,
    StdResolver, SystemReset,
};
pub use reassembly::{AlignmentPolicy, ReassemblyBuffer};
pub use timer::RetryTimer;
pub use transfer::{
    AbortRegistration, ResponseMeta, TransferAbort, TransferCoordinator, TransferSettings,
    TransferSink, TransportError,
};

// Update flow:
// 1. A trigger (shell, timer, application) raises UPDATE_REQUESTED
// 2. The task downloads the image and streams it to the co-processor
// 3. The completion gate runs the host callback and acknowledges
// 4. The task finalizes the device update, waits, then resets the host
