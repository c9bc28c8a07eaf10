//! The wire format shared by producers, workers and the master.
//!
//! Messages are MessagePack maps keyed by field name, so peers written in other languages can
//! decode them without knowing the field order.
use serde::{de::DeserializeOwned, Serialize};

use crate::transport::TransportError;

pub fn encode<T>(value: &T) -> Result<Vec<u8>, TransportError>
where
    T: Serialize + ?Sized,
{
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode<T>(payload: &[u8]) -> Result<T, TransportError>
where
    T: DeserializeOwned,
{
    Ok(rmp_serde::from_slice(payload)?)
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use crate::{job::Job, ping::Ping};

    use super::*;

    #[test]
    fn fields_are_encoded_by_name() {
        let payload = encode(&Ping {
            worker_id: "worker-1".into(),
        })
        .unwrap();

        let value = rmpv::decode::read_value(&mut payload.as_slice()).unwrap();

        assert_eq!(
            value,
            rmpv::Value::Map(vec![(
                rmpv::Value::from("worker_id"),
                rmpv::Value::from("worker-1")
            )])
        );
    }

    #[test]
    fn job_record_survives_the_wire() {
        let job = Job::new("job-1", "thumbnail")
            .with_priority(-2)
            .with_max_retry(3)
            .with_argument([("path".to_owned(), rmpv::Value::from("/tmp/a.png"))].into())
            .with_timeout(std::time::Duration::from_secs(90));

        let decoded: Job = decode(&encode(&job).unwrap()).unwrap();

        assert_eq!(decoded, job);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert_matches!(
            decode::<Ping>(&[0xc1, 0x00, 0xff]),
            Err(TransportError::Decode(_))
        );
    }
}
