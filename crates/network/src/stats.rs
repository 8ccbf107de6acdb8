//! Wire format for the aggregated stats map and the textual stats listing.
//!
//! The map is a big-endian `i32` entry count followed by, per entry, a
//! big-endian `i32` byte length, the UTF-8 name, and a big-endian `i32`
//! value.

use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;

use crate::error::{MeshError, Result};

/// Fails only if the entry count or a name length does not fit the `i32`
/// prefix.
pub fn encode_stats_map(stats: &BTreeMap<String, i32>) -> Result<Vec<u8>> {
    let capacity = 4 + stats.keys().map(|name| name.len() + 8).sum::<usize>();
    let mut out = BytesMut::with_capacity(capacity);
    out.put_i32(wire_len(stats.len(), "entry count")?);
    for (name, value) in stats {
        out.put_i32(wire_len(name.len(), "name length")?);
        out.put_slice(name.as_bytes());
        out.put_i32(*value);
    }
    Ok(out.to_vec())
}

fn wire_len(len: usize, what: &str) -> Result<i32> {
    i32::try_from(len).map_err(|_| MeshError::StatsEncode(format!("{} {} exceeds i32", what, len)))
}

pub fn decode_stats_map(mut buf: &[u8]) -> Result<BTreeMap<String, i32>> {
    let count = read_len(&mut buf, "entry count")?;
    let mut stats = BTreeMap::new();
    for _ in 0..count {
        let len = read_len(&mut buf, "name length")?;
        if buf.remaining() < len {
            return Err(MeshError::StatsDecode(format!(
                "name needs {} bytes, {} left",
                len,
                buf.remaining()
            )));
        }
        let name = String::from_utf8(buf[..len].to_vec())
            .map_err(|err| MeshError::StatsDecode(err.to_string()))?;
        buf.advance(len);
        let value = read_i32(&mut buf, "value")?;
        stats.insert(name, value);
    }
    if buf.has_remaining() {
        return Err(MeshError::StatsDecode(format!(
            "{} trailing bytes",
            buf.remaining()
        )));
    }
    Ok(stats)
}

/// One line per entry, each terminated by a newline.
pub fn encode_stats_lines(lines: &[String]) -> Vec<u8> {
    let mut out = String::with_capacity(lines.iter().map(|line| line.len() + 1).sum());
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out.into_bytes()
}

fn read_i32(buf: &mut &[u8], what: &str) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(MeshError::StatsDecode(format!("truncated {}", what)));
    }
    Ok(buf.get_i32())
}

fn read_len(buf: &mut &[u8], what: &str) -> Result<usize> {
    let value = read_i32(buf, what)?;
    usize::try_from(value)
        .map_err(|_| MeshError::StatsDecode(format!("negative {}: {}", what, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_map_is_a_bare_count() {
        let encoded = encode_stats_map(&BTreeMap::new()).unwrap();
        assert_eq!(encoded, vec![0, 0, 0, 0]);
        assert!(decode_stats_map(&encoded).unwrap().is_empty());
    }

    #[test]
    fn layout_is_big_endian_length_prefixed() {
        let mut stats = BTreeMap::new();
        stats.insert("ab".to_string(), -2);
        let encoded = encode_stats_map(&stats).unwrap();
        assert_eq!(
            encoded,
            vec![0, 0, 0, 1, 0, 0, 0, 2, b'a', b'b', 0xff, 0xff, 0xff, 0xfe]
        );
    }

    #[test]
    fn empty_name_zero_and_negative_values_survive() {
        let mut stats = BTreeMap::new();
        stats.insert(String::new(), 0);
        stats.insert("peers".to_string(), -17);
        stats.insert("connections".to_string(), i32::MAX);
        let decoded = decode_stats_map(&encode_stats_map(&stats).unwrap()).unwrap();
        assert_eq!(decoded, stats);
    }

    #[test]
    fn truncated_and_trailing_input_is_rejected() {
        let mut stats = BTreeMap::new();
        stats.insert("nodes".to_string(), 3);
        let encoded = encode_stats_map(&stats).unwrap();

        assert!(decode_stats_map(&encoded[..encoded.len() - 1]).is_err());

        let mut padded = encoded.clone();
        padded.push(0);
        assert!(decode_stats_map(&padded).is_err());

        assert!(decode_stats_map(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn oversized_lengths_are_refused() {
        assert_eq!(wire_len(i32::MAX as usize, "name length").unwrap(), i32::MAX);
        assert!(matches!(
            wire_len(i32::MAX as usize + 1, "name length"),
            Err(MeshError::StatsEncode(_))
        ));
    }

    #[test]
    fn lines_are_newline_terminated() {
        let lines = vec!["a".to_string(), "b".to_string()];
        assert_eq!(encode_stats_lines(&lines), b"a\nb\n".to_vec());
        assert!(encode_stats_lines(&[]).is_empty());
    }

    proptest! {
        #[test]
        fn arbitrary_maps_decode_to_themselves(
            stats in prop::collection::btree_map(".{0,12}", any::<i32>(), 0..16)
        ) {
            let decoded = decode_stats_map(&encode_stats_map(&stats).unwrap()).unwrap();
            prop_assert_eq!(decoded, stats);
        }
    }
}
