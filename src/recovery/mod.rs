mod backup;

pub use backup::BackupError;
pub use backup::BackupLoopHandle;
pub use backup::BackupManifest;
pub use backup::BackupState;
pub use backup::RecoveryManager;
pub use backup::RecoveryRequestMsg;
pub use backup::RecoveryResponseMsg;
