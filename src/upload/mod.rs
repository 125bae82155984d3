mod drive;
mod remote;
mod uploader;

pub use drive::GoogleDrive;
pub use remote::{ListFilter, RemoteObject, RemoteStore};
pub use uploader::{RetryPolicy, UploadResult, Uploader};
