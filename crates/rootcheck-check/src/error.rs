/// Fatal, structural errors a checker can hit before it even gets to
/// produce diagnostics. Anything recoverable is reported through
/// [`crate::messenger::Messenger`] instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("required runtime symbol `{0}` was not found in the module")]
    MissingSymbol(&'static str),

    #[error("function `{0}` has more reachable states than the analysis budget allows")]
    StateBudgetExceeded(String),

    #[error("malformed FFI registration table: {0}")]
    MalformedFfiTable(String),
}
