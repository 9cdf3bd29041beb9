use derive_more::Display;

/// Errors raised by oxidnn operators.
///
/// Functions return [`anyhow::Result`], use [`anyhow::Error::downcast_ref`] to classify.
#[derive(Clone, Debug, Display, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// Parameters, shapes, dtypes or write requests the operator cannot express.
    #[display(fmt = "configuration error: {}", _0)]
    Configuration(String),
    /// The implementation search exhausted every candidate and every flexible descriptor.
    #[display(fmt = "no viable implementation: {}", _0)]
    NoViableImplementation(String),
}

impl Error {
    pub(crate) fn configuration(msg: impl Into<String>) -> anyhow::Error {
        Self::Configuration(msg.into()).into()
    }
    pub(crate) fn no_viable_implementation(msg: impl Into<String>) -> anyhow::Error {
        Self::NoViableImplementation(msg.into()).into()
    }
}

/// Returns the [`Error`] carried by `error`, if any.
pub fn classify(error: &anyhow::Error) -> Option<&Error> {
    error.downcast_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_configuration() {
        let error = Error::configuration("kernel must be > 0");
        assert_eq!(
            classify(&error),
            Some(&Error::Configuration("kernel must be > 0".into()))
        );
        assert_eq!(
            error.to_string(),
            "configuration error: kernel must be > 0"
        );
    }

    #[test]
    fn classify_other() {
        let error = anyhow::anyhow!("io");
        assert!(classify(&error).is_none());
    }
}
