pub type VeilcamResult<T> = Result<T, VeilcamError>;

#[derive(thiserror::Error, Debug)]
pub enum VeilcamError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("gpu error: {0}")]
    Gpu(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("render error: {0}")]
    Render(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VeilcamError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn gpu(msg: impl Into<String>) -> Self {
        Self::Gpu(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(
            VeilcamError::validation("x")
                .to_string()
                .contains("validation error:")
        );
        assert!(VeilcamError::gpu("x").to_string().contains("gpu error:"));
        assert!(
            VeilcamError::inference("x")
                .to_string()
                .contains("inference error:")
        );
        assert!(
            VeilcamError::render("x")
                .to_string()
                .contains("render error:")
        );
    }

    #[test]
    fn other_preserves_source() {
        let base = std::io::Error::other("boom");
        let err = VeilcamError::Other(anyhow::Error::new(base));
        assert!(err.to_string().contains("boom"));
    }
}
