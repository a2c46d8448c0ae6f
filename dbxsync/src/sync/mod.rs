pub mod archive;
pub mod content_hash;
pub mod engine;
pub mod ignore;
pub mod ledger;
pub mod paths;
pub mod progress;
pub mod timestamp;
pub mod transfer;
pub mod walker;
