/// Error from driver operations that is not a plain OS error.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// Signal number outside the supported table.
    #[error("signal {0} outside the supported range 0..32")]
    SignalOutOfRange(i32),
}
