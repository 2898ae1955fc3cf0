use crate::datasource::InstallState;
use flux_install_api::InstallError;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
}

/// Host-visible error. `summary` is printed verbatim by the host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    pub retryable: bool,
}

impl From<&InstallError> for Diagnostic {
    fn from(err: &InstallError) -> Self {
        Self {
            severity: Severity::Error,
            summary: err.to_string(),
            attribute: err.attribute().map(str::to_string),
            retryable: err.is_retryable(),
        }
    }
}

/// Answer to one read request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadResponse {
    State(Box<InstallState>),
    Diagnostics(Vec<Diagnostic>),
}

impl ReadResponse {
    pub fn from_result(result: Result<InstallState, InstallError>) -> Self {
        match result {
            Ok(state) => ReadResponse::State(Box::new(state)),
            Err(err) => ReadResponse::Diagnostics(vec![Diagnostic::from(&err)]),
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            ReadResponse::State(_) => &[],
            ReadResponse::Diagnostics(diags) => diags,
        }
    }
}
