//! Backup/restore orchestration (C9, spec §4.9): storage provider plug-ins
//! plus a two-phase, token-gated restore flow.

pub mod coordinator;
pub mod provider;

pub use coordinator::{
    BackupCoordinator, BackupMetadata, BackupStatus, BackupType, ComponentValidation,
    CreateBackupOpts, IntegrityCheck, RestoreOutcome, RestorePreview, RestoreToken, RetentionPolicy,
    ValidationStatus,
};
pub use provider::{FileStat, LocalFilesystemProvider, ProviderRegistry, StorageProvider, LOCAL_PROVIDER_ID};
