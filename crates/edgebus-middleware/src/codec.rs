//! Ready-made JSON converters for [`Edge`][crate::edge::Edge].

use edgebus_types::{BoxError, Envelope};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Outbound converter that JSON-encodes the value into the envelope payload.
pub fn json_to_envelope<T>()
-> impl Fn(T) -> Result<Envelope, BoxError> + Send + Sync + Clone + 'static
where
    T: Serialize + 'static,
{
    |value: T| Envelope::from_json(&value).map_err(Into::into)
}

/// Inbound converter that JSON-decodes the envelope payload.
pub fn json_from_envelope<T>()
-> impl Fn(&Envelope) -> Result<T, BoxError> + Send + Sync + Clone + 'static
where
    T: DeserializeOwned + 'static,
{
    |envelope: &Envelope| envelope.decode_json().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        sku: String,
        quantity: u32,
    }

    #[test]
    fn json_converters_pair_up() {
        let to = json_to_envelope::<Order>();
        let from = json_from_envelope::<Order>();

        let envelope = to(Order {
            sku: "A-1".to_string(),
            quantity: 3,
        })
        .unwrap();
        assert_eq!(envelope.data, br#"{"sku":"A-1","quantity":3}"#.to_vec());

        let back = from(&envelope).unwrap();
        assert_eq!(back.sku, "A-1");
        assert_eq!(back.quantity, 3);
    }

    #[test]
    fn json_from_envelope_rejects_garbage() {
        let from = json_from_envelope::<Order>();
        let err = from(&Envelope::new(b"not json".to_vec())).unwrap_err();
        assert!(!err.to_string().is_empty());
    }
}
