//! Wire envelope for collector reporting
//!
//! Every sample travels as one self-describing JSON object on its own line:
//!
//! ```text
//! {"kind":"cpu","host":"node-1","payload":{"workload_id":"app1",...}}
//! ```
//!
//! The payload is the sample's own JSON text, carried verbatim so that the
//! collector can route on `kind` before decoding it.

use crate::models::{MetricKind, UsageSample};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Self-describing wire unit pairing a metric kind and source host with a sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MetricKind,
    pub host: String,
    pub payload: Box<RawValue>,
}

impl Envelope {
    /// Wrap a sample, serializing it into the opaque payload
    pub fn seal(sample: &UsageSample, host: impl Into<String>) -> serde_json::Result<Self> {
        let payload = match sample {
            UsageSample::Cpu(s) => serde_json::value::to_raw_value(s)?,
            UsageSample::Memory(s) => serde_json::value::to_raw_value(s)?,
        };

        Ok(Self {
            kind: sample.kind(),
            host: host.into(),
            payload,
        })
    }

    /// Encode as a single newline-terminated line
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Decode one line produced by [`Envelope::to_line`]
    pub fn from_line(line: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(line)
    }

    /// Decode the payload into the sample type named by `kind`
    pub fn open<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(self.payload.get())
    }

    /// Decode the payload back into a tagged sample
    pub fn to_sample(&self) -> serde_json::Result<UsageSample> {
        Ok(match self.kind {
            MetricKind::Cpu => UsageSample::Cpu(self.open()?),
            MetricKind::Memory => UsageSample::Memory(self.open()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CpuUsageSample, MemoryUsageSample};
    use chrono::Utc;

    fn cpu_sample() -> CpuUsageSample {
        CpuUsageSample {
            workload_id: "app1".to_string(),
            total_usage_ns: 5_000_000_000,
            user_mode_ns: 3_000_000_000,
            system_mode_ns: 1_500_000_000,
            per_cpu_usage_ns: vec![2_000_000_000, 3_000_000_000],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_cpu_sample_survives_the_wire() {
        let sample = UsageSample::Cpu(cpu_sample());
        let line = Envelope::seal(&sample, "node-1").unwrap().to_line().unwrap();

        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);

        let received = Envelope::from_line(&line).unwrap();
        assert_eq!(received.kind, MetricKind::Cpu);
        assert_eq!(received.host, "node-1");
        assert_eq!(received.to_sample().unwrap(), sample);
    }

    #[test]
    fn test_memory_sample_survives_the_wire() {
        let sample = MemoryUsageSample {
            workload_id: "app2".to_string(),
            usage_bytes: 500_000_000,
            max_usage_bytes: 900_000_000,
            limit_bytes: 1_000_000_000,
            created_at: Utc::now(),
        };
        let envelope = Envelope::seal(&sample.clone().into(), "node-1").unwrap();
        let received = Envelope::from_line(&envelope.to_line().unwrap()).unwrap();

        assert_eq!(received.kind, MetricKind::Memory);
        assert_eq!(received.open::<MemoryUsageSample>().unwrap(), sample);
    }

    #[test]
    fn test_envelope_field_names() {
        let envelope = Envelope::seal(&UsageSample::Cpu(cpu_sample()), "node-1").unwrap();
        let value: serde_json::Value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["kind"], "cpu");
        assert_eq!(value["host"], "node-1");
        assert_eq!(value["payload"]["workload_id"], "app1");
        assert_eq!(value["payload"]["per_cpu_usage_ns"][1], 3_000_000_000u64);
    }
}
