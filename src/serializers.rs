//! Serde support for error types from other crates, which can't implement
//! [Serialize](serde::Serialize) themselves

use {serde::Serializer, std::error::Error};

/// Serializes a foreign error as its message followed by the messages of
/// its sources, separated by `": "`
pub fn serialize_error<S, E>(error: &E, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    E: Error,
{
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    serializer.collect_str(&message)
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(serde::Serialize)]
    struct Wrapper {
        #[serde(serialize_with = "serialize_error")]
        error: std::io::Error,
    }

    #[test]
    fn io_error_message() {
        let wrapper = Wrapper {
            error: std::io::Error::other("disk on fire"),
        };
        assert_eq!(
            serde_json::to_string(&wrapper).unwrap(),
            r#"{"error":"disk on fire"}"#
        );
    }
}
