use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Entity not found")]
    NotFound,

    #[error("Unique constraint violation: {constraint:?}")]
    UniqueViolation {
        constraint: Option<String>,
        table: Option<String>,
        message: String,
    },

    #[error("Check constraint violation: {constraint:?}")]
    CheckViolation {
        constraint: Option<String>,
        table: Option<String>,
        message: String,
    },

    #[error("Foreign key violation: {constraint:?}")]
    ForeignKeyViolation {
        constraint: Option<String>,
        table: Option<String>,
        message: String,
    },

    #[error("Stored value could not be decoded: {message}")]
    Corrupt { message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::RowNotFound = err {
            return DbError::NotFound;
        }
        if let Some(db_err) = err.as_database_error() {
            let constraint = db_err.constraint().map(str::to_string);
            let table = db_err.table().map(str::to_string);
            let message = db_err.message().to_string();
            if db_err.is_unique_violation() {
                return DbError::UniqueViolation { constraint, table, message };
            }
            if db_err.is_check_violation() {
                return DbError::CheckViolation { constraint, table, message };
            }
            if db_err.is_foreign_key_violation() {
                return DbError::ForeignKeyViolation { constraint, table, message };
            }
        }
        DbError::Other(err.into())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Corrupt { message: err.to_string() }
    }
}
