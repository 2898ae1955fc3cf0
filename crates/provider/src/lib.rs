pub mod datasource;
pub mod response;

pub use datasource::{ATTRIBUTES, InstallDataSource, InstallState, decode_attributes};
pub use response::{Diagnostic, ReadResponse, Severity};
