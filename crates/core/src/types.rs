/// Caller account identifiers match the `sub` claim of access tokens.
pub type AccountId = i64;

/// Credit amounts and balances are whole credits.
pub type Credits = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
