pub mod app;
pub mod job;

pub use app::{build_router, AppState, TransferView};
pub use job::{dispatch, run_transfer_job};
