//! Error type for catalog and placement operations, with its translation
//! to control-plane status codes
use err_derive::Error;
use http::StatusCode;

#[derive(Debug, Error)]
pub enum MetaError {
	#[error(display = "Catalog error: {}", _0)]
	Db(#[error(source)] rusqlite::Error),

	#[error(display = "{}", _0)]
	Internal(#[error(source)] silo_util::error::Error),

	#[error(display = "Invalid path: {}", _0)]
	InvalidPath(String),

	#[error(display = "Bad request: {}", _0)]
	BadRequest(String),

	#[error(display = "Entry not found: {}", _0)]
	NoSuchEntry(String),

	#[error(display = "Block not found")]
	NoSuchBlock,

	#[error(display = "Datanode not found")]
	NoSuchNode,

	#[error(display = "Entry already exists: {}", _0)]
	AlreadyExists(String),

	#[error(display = "Parent directory does not exist: {}", _0)]
	ParentMissing(String),

	#[error(display = "Parent is not a directory: {}", _0)]
	ParentNotDirectory(String),

	#[error(display = "Not a directory: {}", _0)]
	NotDirectory(String),

	#[error(display = "Is a directory: {}", _0)]
	IsDirectory(String),

	#[error(display = "Directory not empty: {}", _0)]
	DirectoryNotEmpty(String),

	#[error(display = "No datanode with sufficient capacity")]
	InsufficientCapacity,

	#[error(display = "Not the leader coordinator ({})", _0)]
	NotLeader(String),
}

// Catalog results cross into infrastructure code (workers, servers) that
// deals in the common error type
impl From<MetaError> for silo_util::error::Error {
	fn from(e: MetaError) -> Self {
		match e {
			MetaError::Internal(e) => e,
			e => silo_util::error::Error::Message(e.to_string()),
		}
	}
}

impl MetaError {
	/// Status code returned on the control plane for this error
	pub fn http_status_code(&self) -> StatusCode {
		match self {
			MetaError::InvalidPath(_)
			| MetaError::BadRequest(_)
			| MetaError::ParentNotDirectory(_)
			| MetaError::NotDirectory(_)
			| MetaError::IsDirectory(_) => StatusCode::BAD_REQUEST,
			MetaError::NoSuchEntry(_)
			| MetaError::NoSuchBlock
			| MetaError::NoSuchNode
			| MetaError::ParentMissing(_) => StatusCode::NOT_FOUND,
			MetaError::AlreadyExists(_) | MetaError::DirectoryNotEmpty(_) => StatusCode::CONFLICT,
			MetaError::InsufficientCapacity => StatusCode::INSUFFICIENT_STORAGE,
			MetaError::NotLeader(_) => StatusCode::SERVICE_UNAVAILABLE,
			MetaError::Db(_) | MetaError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}
