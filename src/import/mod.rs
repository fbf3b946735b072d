pub mod archive;
pub mod batch;
pub mod importer;

pub use archive::{ArchiveExtractor, ArchiveHandle};
pub use batch::{CommitOutcome, CommittedBatch, ImportBatch, NodeRef, PendingId, StagedImport};
pub use importer::TreeImporter;
