//! Motion row grammar.
//!
//! Table files carry one row per line:
//!
//! ```text
//! CT1 M<node> H<offset> VF<vf> VB<vb>     homing parameters, first line only
//! CT1 M<node> S<position> T<dwell_ms>     one interpolation sample
//! ```
//!
//! The streaming pipe carries `CT1 M<node> P<pos> VM<vel> AM<acc> [1]`
//! lines; a trailing `1` is the start flag.

use alma_common::NodeId;
use thiserror::Error;

/// Parse failures; each maps to a skipped row plus a `FileError` event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("row does not start with CT1 M")]
    BadPrefix,
    #[error("row addresses node {found}, expected {expected}")]
    WrongNode { expected: NodeId, found: NodeId },
    #[error("unknown record kind")]
    BadKind,
    #[error("malformed field")]
    BadField,
    #[error("sample dwell must be a non-zero T field")]
    BadDwell,
    #[error("homing record allowed only as the first row")]
    HomingNotFirst,
}

/// One parsed table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableRow {
    Homing {
        offset: i32,
        forward_velocity: u32,
        backward_velocity: u32,
    },
    Sample {
        position: i32,
        dwell_ms: u32,
    },
}

/// One parsed streaming-pipe row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRow {
    pub node: NodeId,
    pub position: i32,
    pub velocity: u32,
    pub acceleration: u32,
    pub start: bool,
}

fn strip_tagged<'a>(token: &'a str, tag: &str) -> Result<&'a str, RowError> {
    token.strip_prefix(tag).ok_or(RowError::BadField)
}

fn parse_node(token: &str) -> Result<NodeId, RowError> {
    strip_tagged(token, "M")?
        .parse::<NodeId>()
        .map_err(|_| RowError::BadField)
}

/// Parse one table-file line for `node`. Blank lines yield `Ok(None)`;
/// `first` is true while no record has been accepted yet.
pub fn parse_table_row(
    line: &str,
    node: NodeId,
    first: bool,
) -> Result<Option<TableRow>, RowError> {
    let line = line.trim_end();
    if line.is_empty() {
        return Ok(None);
    }

    let mut fields = line.split_whitespace();
    if fields.next() != Some("CT1") {
        return Err(RowError::BadPrefix);
    }
    let row_node = parse_node(fields.next().ok_or(RowError::BadPrefix)?)?;
    if row_node != node {
        return Err(RowError::WrongNode {
            expected: node,
            found: row_node,
        });
    }

    let record = fields.next().ok_or(RowError::BadKind)?;
    match record.as_bytes().first() {
        Some(b'S') => {
            let position: i32 = record[1..].parse().map_err(|_| RowError::BadField)?;
            let dwell_field = fields.next().ok_or(RowError::BadDwell)?;
            let dwell_ms: u32 = strip_tagged(dwell_field, "T")?
                .parse()
                .map_err(|_| RowError::BadDwell)?;
            if dwell_ms == 0 {
                return Err(RowError::BadDwell);
            }
            Ok(Some(TableRow::Sample { position, dwell_ms }))
        }
        Some(b'H') => {
            if !first {
                return Err(RowError::HomingNotFirst);
            }
            let offset: i32 = record[1..].parse().map_err(|_| RowError::BadField)?;
            let forward_velocity: u32 = strip_tagged(fields.next().ok_or(RowError::BadField)?, "VF")?
                .parse()
                .map_err(|_| RowError::BadField)?;
            let backward_velocity: u32 =
                strip_tagged(fields.next().ok_or(RowError::BadField)?, "VB")?
                    .parse()
                    .map_err(|_| RowError::BadField)?;
            Ok(Some(TableRow::Homing {
                offset,
                forward_velocity,
                backward_velocity,
            }))
        }
        _ => Err(RowError::BadKind),
    }
}

/// Parse one streaming-pipe line. Any node is accepted; the caller routes
/// by the returned id.
pub fn parse_stream_row(line: &str) -> Result<Option<StreamRow>, RowError> {
    let line = line.trim_end();
    if line.is_empty() {
        return Ok(None);
    }

    let mut fields = line.split_whitespace();
    if fields.next() != Some("CT1") {
        return Err(RowError::BadPrefix);
    }
    let node = parse_node(fields.next().ok_or(RowError::BadPrefix)?)?;
    let position: i32 = strip_tagged(fields.next().ok_or(RowError::BadField)?, "P")?
        .parse()
        .map_err(|_| RowError::BadField)?;
    let velocity: u32 = strip_tagged(fields.next().ok_or(RowError::BadField)?, "VM")?
        .parse()
        .map_err(|_| RowError::BadField)?;
    let acceleration: u32 = strip_tagged(fields.next().ok_or(RowError::BadField)?, "AM")?
        .parse()
        .map_err(|_| RowError::BadField)?;
    let start = matches!(fields.next(), Some(flag) if flag.parse::<u32>().map_or(false, |v| v > 0));

    Ok(Some(StreamRow {
        node,
        position,
        velocity,
        acceleration,
        start,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sample_row() {
        let row = parse_table_row("CT1 M119 S1000 T100", 119, false).unwrap();
        assert_eq!(
            row,
            Some(TableRow::Sample {
                position: 1000,
                dwell_ms: 100
            })
        );
    }

    #[test]
    fn parses_negative_position() {
        let row = parse_table_row("CT1 M119 S-2500 T50", 119, false).unwrap();
        assert_eq!(
            row,
            Some(TableRow::Sample {
                position: -2500,
                dwell_ms: 50
            })
        );
    }

    #[test]
    fn parses_homing_first_row() {
        let row = parse_table_row("CT1 M119 H2000 VF10000 VB10000", 119, true).unwrap();
        assert_eq!(
            row,
            Some(TableRow::Homing {
                offset: 2000,
                forward_velocity: 10000,
                backward_velocity: 10000
            })
        );
    }

    #[test]
    fn homing_rejected_after_first_row() {
        assert_eq!(
            parse_table_row("CT1 M119 H2000 VF10000 VB10000", 119, false),
            Err(RowError::HomingNotFirst)
        );
    }

    #[test]
    fn sample_requires_nonzero_dwell() {
        assert_eq!(
            parse_table_row("CT1 M119 S1000 T0", 119, false),
            Err(RowError::BadDwell)
        );
        // Missing T field entirely.
        assert_eq!(
            parse_table_row("CT1 M119 S T50", 119, false),
            Err(RowError::BadField)
        );
    }

    #[test]
    fn wrong_node_is_rejected() {
        assert_eq!(
            parse_table_row("CT1 M120 S1000 T100", 119, false),
            Err(RowError::WrongNode {
                expected: 119,
                found: 120
            })
        );
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse_table_row("", 119, true), Ok(None));
        assert_eq!(parse_table_row("   \r", 119, true), Ok(None));
    }

    #[test]
    fn parses_stream_row_with_start_flag() {
        let row = parse_stream_row("CT1 M119 P5000 VM300000 AM100 1").unwrap().unwrap();
        assert_eq!(row.node, 119);
        assert_eq!(row.position, 5000);
        assert!(row.start);

        let row = parse_stream_row("CT1 M119 P5000 VM300000 AM100").unwrap().unwrap();
        assert!(!row.start);
    }

    #[test]
    fn stream_row_requires_all_fields() {
        assert!(parse_stream_row("CT1 M119 P5000 VM300000").is_err());
        assert!(parse_stream_row("CT0 M119 P5000 VM1 AM1").is_err());
    }
}
