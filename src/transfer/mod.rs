// 传输模块入口
pub mod mirror;
pub mod progress;

pub use mirror::RemoteFileMirror;
pub use progress::ProgressTracker;
