pub mod command;
pub mod types;

use crate::error::ConvertError;

pub use command::CommandConverter;
pub use types::{ConvertOutput, ConvertRequest};

/// One concrete way of turning a source file into a target format.
///
/// Implementations must honor `req.timeout`, releasing whatever they started
/// before returning [`ConvertError::Timeout`], and must not leave partial
/// output behind on any error.
pub trait Converter: Send + Sync {
    /// Tool family; methods sharing a name are skipped together when the tool is unavailable.
    fn name(&self) -> &str;
    fn convert(&self, req: &ConvertRequest<'_>) -> Result<ConvertOutput, ConvertError>;
}
