use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{info, warn};
use nom::{
    IResult,
    bytes::complete::is_not,
    character::complete::{i64 as parse_i64, space0, space1},
    combinator::all_consuming,
    number::complete::double,
};

use crate::error::{Error, Result};
use crate::player::Player;
use crate::system::System;

/// One row of the clock offset table.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockOffset {
    pub rank: i64,
    pub hostname: String,
    /// Nanoseconds to add to every clock of the host.
    pub offset: f64,
    pub std: f64,
}

fn parse_row(input: &str) -> IResult<&str, ClockOffset> {
    let (input, _) = space0(input)?;
    let (input, rank) = parse_i64(input)?;
    let (input, _) = space1(input)?;
    let (input, hostname) = is_not(" \t\r\n")(input)?;
    let (input, _) = space1(input)?;
    let (input, offset) = double(input)?;
    let (input, _) = space1(input)?;
    let (input, std) = double(input)?;
    let (input, _) = space0(input)?;
    Ok((
        input,
        ClockOffset {
            rank,
            hostname: hostname.to_owned(),
            offset,
            std,
        },
    ))
}

/// Parses the table. The first line is a header and is ignored.
pub fn parse(text: &str) -> Result<Vec<ClockOffset>> {
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let (_, row) = all_consuming(parse_row)(line.trim_end()).map_err(|_| {
            Error::config(format!(
                "clock offset table line {}: cannot parse '{}'",
                lineno + 1,
                line
            ))
        })?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn load<P: AsRef<Path>>(path: P) -> Result<Vec<ClockOffset>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    parse(&text)
}

/// Sets the offset of every loom listed in the table and of all its streams.
/// Must be called before the first event is played.
pub fn apply(rows: &[ClockOffset], system: &mut System, player: &mut Player) -> Result<()> {
    let hosts: BTreeMap<&str, usize> = system
        .looms
        .iter()
        .enumerate()
        .map(|(i, loom)| (loom.hostname.as_str(), i))
        .collect();

    let mut offsets = BTreeMap::new();
    for row in rows {
        let loom = *hosts.get(row.hostname.as_str()).ok_or_else(|| {
            Error::config(format!(
                "clock offset table: no loom for host '{}'",
                row.hostname
            ))
        })?;
        // Rounded toward zero
        let offset = row.offset as i64;
        if offsets.insert(loom, offset).is_some() {
            warn!(
                "clock offset table: duplicated entry for host '{}', using {}",
                row.hostname, offset
            );
        }
    }

    for (loom, offset) in offsets {
        let loom = &mut system.looms[loom];
        info!("loom {}: clock offset {} ns", loom.name, offset);
        loom.clock_offset = offset;
        for proc in &loom.procs {
            for th in &system.procs[proc.0].threads {
                player.stream_mut(th.0).set_clock_offset(offset)?;
            }
        }
    }
    Ok(())
}
