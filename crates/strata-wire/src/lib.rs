#![forbid(unsafe_code)]
//! Little-endian wire codec for the buffer-organizer RPC surface.
//!
//! The wire contract is bit-identical for the packed 64-bit identifiers and
//! encodes every enumeration as a little-endian `u32`. Strings are UTF-8
//! with a `u32` byte-length prefix; sequences carry a `u32` element count.
//! Decoding never panics: short payloads, bad discriminants, and invalid
//! UTF-8 all surface as [`WireError`].

use strata_types::{
    BlobId, BoOperation, BoPriority, BoTask, BucketId, BufferId, BufferInfo, MapType,
    PlacementSchema, PrefetchContext, PrefetchHint, SubPlacement, SwapBlob, TargetId, TargetInfo,
    ThresholdViolation, VBucketId, ViolationInfo,
};
use thiserror::Error;

/// Decode failure for a wire payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },

    #[error("invalid {kind} discriminant {value}")]
    InvalidDiscriminant { kind: &'static str, value: u32 },

    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("declared length {declared} overflows the payload")]
    LengthOverflow { declared: u64 },

    #[error("trailing garbage: {remaining} bytes left after decode")]
    TrailingBytes { remaining: usize },
}

/// Sequential little-endian reader over a borrowed payload.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let Some(end) = self.pos.checked_add(len) else {
            return Err(WireError::LengthOverflow {
                declared: len as u64,
            });
        };
        if end > self.data.len() {
            return Err(WireError::InsufficientData {
                needed: len,
                offset: self.pos,
                actual: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_bits(self.u32()?))
    }

    pub fn f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_bits(self.u64()?))
    }

    pub fn bool(&mut self) -> Result<bool, WireError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(WireError::InvalidDiscriminant {
                kind: "bool",
                value: u32::from(value),
            }),
        }
    }

    pub fn string(&mut self) -> Result<String, WireError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }
}

/// Value that can be appended to a wire payload.
pub trait WireEncode {
    fn encode(&self, out: &mut Vec<u8>);
}

/// Value that can be decoded from a wire payload.
pub trait WireDecode: Sized {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError>;
}

/// Encode a value into a fresh payload.
#[must_use]
pub fn to_vec<T: WireEncode>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    value.encode(&mut out);
    out
}

/// Decode a value and require the payload to be fully consumed.
pub fn from_slice<T: WireDecode>(data: &[u8]) -> Result<T, WireError> {
    let mut reader = WireReader::new(data);
    let value = T::decode(&mut reader)?;
    if reader.remaining() != 0 {
        return Err(WireError::TrailingBytes {
            remaining: reader.remaining(),
        });
    }
    Ok(value)
}

// ── Primitives ──────────────────────────────────────────────────────────────

impl WireEncode for u32 {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl WireDecode for u32 {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.u32()
    }
}

impl WireEncode for u64 {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl WireDecode for u64 {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.u64()
    }
}

impl WireEncode for i64 {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl WireDecode for i64 {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(i64::from_le_bytes(r.u64()?.to_le_bytes()))
    }
}

impl WireEncode for f32 {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_bits().to_le_bytes());
    }
}

impl WireDecode for f32 {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.f32()
    }
}

impl WireEncode for f64 {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_bits().to_le_bytes());
    }
}

impl WireDecode for f64 {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.f64()
    }
}

impl WireEncode for bool {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }
}

impl WireDecode for bool {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.bool()
    }
}

impl WireEncode for String {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_str().encode(out);
    }
}

impl WireEncode for &str {
    fn encode(&self, out: &mut Vec<u8>) {
        (self.len() as u32).encode(out);
        out.extend_from_slice(self.as_bytes());
    }
}

impl WireDecode for String {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.string()
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, out: &mut Vec<u8>) {
        (self.len() as u32).encode(out);
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let count = r.u32()? as usize;
        // Cap the reservation by what the payload could possibly hold.
        let mut items = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            items.push(T::decode(r)?);
        }
        Ok(items)
    }
}

// ── Identifiers (bit-identical u64) ─────────────────────────────────────────

macro_rules! wire_id {
    ($ty:ty) => {
        impl WireEncode for $ty {
            fn encode(&self, out: &mut Vec<u8>) {
                self.as_u64().encode(out);
            }
        }

        impl WireDecode for $ty {
            fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
                Ok(<$ty>::from_u64(r.u64()?))
            }
        }
    };
}

wire_id!(BufferId);
wire_id!(TargetId);
wire_id!(BlobId);
wire_id!(BucketId);
wire_id!(VBucketId);

// ── Enumerations (little-endian u32) ────────────────────────────────────────

macro_rules! wire_enum {
    ($ty:ty, $kind:literal) => {
        impl WireEncode for $ty {
            fn encode(&self, out: &mut Vec<u8>) {
                self.as_u32().encode(out);
            }
        }

        impl WireDecode for $ty {
            fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
                let value = r.u32()?;
                <$ty>::from_u32(value).ok_or(WireError::InvalidDiscriminant { kind: $kind, value })
            }
        }
    };
}

wire_enum!(MapType, "MapType");
wire_enum!(BoPriority, "BoPriority");
wire_enum!(BoOperation, "BoOperation");
wire_enum!(ThresholdViolation, "ThresholdViolation");
wire_enum!(PrefetchHint, "PrefetchHint");

// ── Composite payloads ──────────────────────────────────────────────────────

impl WireEncode for BufferInfo {
    fn encode(&self, out: &mut Vec<u8>) {
        self.id.encode(out);
        self.bandwidth_mbps.encode(out);
        self.size.encode(out);
    }
}

impl WireDecode for BufferInfo {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            id: BufferId::decode(r)?,
            bandwidth_mbps: r.f32()?,
            size: r.u64()?,
        })
    }
}

impl WireEncode for TargetInfo {
    fn encode(&self, out: &mut Vec<u8>) {
        self.id.encode(out);
        self.bandwidth_mbps.encode(out);
        self.capacity.encode(out);
    }
}

impl WireDecode for TargetInfo {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            id: TargetId::decode(r)?,
            bandwidth_mbps: r.f32()?,
            capacity: r.u64()?,
        })
    }
}

impl WireEncode for SwapBlob {
    fn encode(&self, out: &mut Vec<u8>) {
        self.node_id.encode(out);
        self.offset.encode(out);
        self.size.encode(out);
        self.bucket_id.encode(out);
    }
}

impl WireDecode for SwapBlob {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            node_id: r.u32()?,
            offset: r.u64()?,
            size: r.u64()?,
            bucket_id: BucketId::decode(r)?,
        })
    }
}

impl WireEncode for SubPlacement {
    fn encode(&self, out: &mut Vec<u8>) {
        self.size.encode(out);
        self.target.encode(out);
    }
}

impl WireDecode for SubPlacement {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            size: r.u64()?,
            target: TargetId::decode(r)?,
        })
    }
}

impl WireEncode for PlacementSchema {
    fn encode(&self, out: &mut Vec<u8>) {
        self.placements.encode(out);
    }
}

impl WireDecode for PlacementSchema {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            placements: Vec::<SubPlacement>::decode(r)?,
        })
    }
}

impl WireEncode for ViolationInfo {
    fn encode(&self, out: &mut Vec<u8>) {
        self.target.encode(out);
        self.violation.encode(out);
        self.violation_size.encode(out);
    }
}

impl WireDecode for ViolationInfo {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            target: TargetId::decode(r)?,
            violation: ThresholdViolation::decode(r)?,
            violation_size: r.u64()?,
        })
    }
}

impl WireEncode for PrefetchContext {
    fn encode(&self, out: &mut Vec<u8>) {
        self.hint.encode(out);
        self.read_ahead.encode(out);
    }
}

impl WireDecode for PrefetchContext {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            hint: PrefetchHint::decode(r)?,
            read_ahead: r.u32()?,
        })
    }
}

impl WireEncode for BoTask {
    fn encode(&self, out: &mut Vec<u8>) {
        self.operation().encode(out);
        match self {
            BoTask::Move { src, dests, blob } => {
                src.encode(out);
                dests.encode(out);
                blob.encode(out);
            }
            BoTask::Copy { src, dest } => {
                src.encode(out);
                dest.encode(out);
            }
            BoTask::Delete { src } => {
                src.encode(out);
            }
        }
    }
}

impl WireDecode for BoTask {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        match BoOperation::decode(r)? {
            BoOperation::Move => Ok(Self::Move {
                src: BufferId::decode(r)?,
                dests: Vec::<BufferId>::decode(r)?,
                blob: BlobId::decode(r)?,
            }),
            BoOperation::Copy => Ok(Self::Copy {
                src: BufferId::decode(r)?,
                dest: TargetId::decode(r)?,
            }),
            BoOperation::Delete => Ok(Self::Delete {
                src: BufferId::decode(r)?,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip<T>(value: &T) -> T
    where
        T: WireEncode + WireDecode,
    {
        from_slice(&to_vec(value)).expect("round trip")
    }

    #[test]
    fn ids_are_bit_identical() {
        let id = BufferId::from_parts(3, 0x0102_0304);
        let bytes = to_vec(&id);
        assert_eq!(bytes, id.as_u64().to_le_bytes());
        assert_eq!(round_trip(&id), id);
    }

    #[test]
    fn enums_are_le_u32() {
        assert_eq!(to_vec(&BoPriority::Low), 1_u32.to_le_bytes());
        assert_eq!(to_vec(&PrefetchHint::FileStrided), 3_u32.to_le_bytes());
    }

    #[test]
    fn bad_discriminant_is_an_error_not_a_panic() {
        let err = from_slice::<BoOperation>(&7_u32.to_le_bytes()).unwrap_err();
        assert_eq!(
            err,
            WireError::InvalidDiscriminant {
                kind: "BoOperation",
                value: 7
            }
        );
    }

    #[test]
    fn short_payload_is_reported_with_offsets() {
        let err = from_slice::<u64>(&[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            WireError::InsufficientData {
                needed: 8,
                offset: 0,
                actual: 3
            }
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = to_vec(&42_u32);
        bytes.push(0);
        assert_eq!(
            from_slice::<u32>(&bytes).unwrap_err(),
            WireError::TrailingBytes { remaining: 1 }
        );
    }

    #[test]
    fn oversized_vec_count_does_not_overallocate() {
        // Count claims u32::MAX elements with an empty body: must error,
        // not reserve gigabytes.
        let bytes = u32::MAX.to_le_bytes();
        assert!(matches!(
            from_slice::<Vec<u64>>(&bytes),
            Err(WireError::InsufficientData { .. })
        ));
    }

    #[test]
    fn composite_round_trips() {
        let info = BufferInfo {
            id: BufferId::from_parts(1, 9),
            bandwidth_mbps: 1000.0,
            size: 4096,
        };
        assert_eq!(round_trip(&info), info);

        let swap = SwapBlob {
            node_id: 2,
            offset: 1 << 30,
            size: 512,
            bucket_id: BucketId::from_parts(2, 5),
        };
        assert_eq!(round_trip(&swap), swap);

        let violation = ViolationInfo {
            target: TargetId::from_parts(0, 1),
            violation: ThresholdViolation::Max,
            violation_size: 77,
        };
        assert_eq!(round_trip(&violation), violation);

        let prefetch = PrefetchContext {
            hint: PrefetchHint::Apriori,
            read_ahead: 8,
        };
        assert_eq!(round_trip(&prefetch), prefetch);
    }

    #[test]
    fn task_round_trips() {
        let task = BoTask::Move {
            src: BufferId::from_parts(0, 1),
            dests: vec![BufferId::from_parts(0, 2), BufferId::from_parts(0, 3)],
            blob: BlobId::from_parts(0, 7),
        };
        assert_eq!(round_trip(&task), task);

        let task = BoTask::Copy {
            src: BufferId::from_parts(1, 1),
            dest: TargetId::from_parts(1, 0),
        };
        assert_eq!(round_trip(&task), task);

        let task = BoTask::Delete {
            src: BufferId::from_parts(2, 2),
        };
        assert_eq!(round_trip(&task), task);
    }

    proptest! {
        #[test]
        fn prop_schema_round_trip(legs in proptest::collection::vec((any::<u64>(), any::<u64>()), 0..32)) {
            let schema = PlacementSchema {
                placements: legs
                    .into_iter()
                    .map(|(size, target)| SubPlacement {
                        size,
                        target: TargetId::from_u64(target),
                    })
                    .collect(),
            };
            prop_assert_eq!(round_trip(&schema), schema);
        }

        #[test]
        fn prop_string_round_trip(s in ".*") {
            let mut out = Vec::new();
            s.as_str().encode(&mut out);
            prop_assert_eq!(from_slice::<String>(&out).unwrap(), s);
        }
    }
}
