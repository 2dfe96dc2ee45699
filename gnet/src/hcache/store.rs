// Copyright © 2021 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of gnet, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Text-line persistence of cached hosts.
//!
//! One host per line, `<addr>:<port> <utc-timestamp>`. The two halves of a
//! kind share one file with no separator; ordering within each half is by
//! descending insertion time so that a load preserves expiry order.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;

use super::HostKind;
use crate::{clock::Timestamp, host::Host};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Locations of the per-kind host files under one root directory.
#[derive(Clone, Debug)]
pub struct Paths {
    hosts: PathBuf,
    ultras: PathBuf,
    guess: PathBuf,
}

impl Paths {
    pub fn from_root(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        Ok(Self {
            hosts: root.join("hosts"),
            ultras: root.join("ultras"),
            guess: root.join("guess"),
        })
    }

    pub fn for_kind(&self, kind: HostKind) -> &Path {
        match kind {
            HostKind::Any => &self.hosts,
            HostKind::Ultra => &self.ultras,
            HostKind::Guess => &self.guess,
        }
    }
}

pub(super) fn write<I>(path: &Path, lines: I) -> Result<(), Error>
where
    I: IntoIterator<Item = (Host, Timestamp)>,
{
    let mut out = BufWriter::new(File::create(path)?);
    for (host, added) in lines {
        writeln!(out, "{} {}", host, added.to_utc_string())?;
    }
    out.flush()?;
    Ok(())
}

/// Parse a host file. A `None` timestamp means the line carried none, or one
/// that did not parse; the caller clamps either way. Lines without a
/// readable host are skipped. A missing file reads as empty.
pub(super) fn read(path: &Path) -> Result<Vec<(Host, Option<Timestamp>)>, Error> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (host, stamp) = match line.find(' ') {
            Some(pos) => (&line[..pos], Some(line[pos + 1..].trim())),
            None => (line, None),
        };
        let host: Host = match host.parse() {
            Ok(host) => host,
            Err(e) => {
                tracing::warn!(err = %e, %line, "skipping malformed host line");
                continue;
            },
        };
        let stamp = stamp.and_then(|s| Timestamp::parse_utc(s).ok());
        out.push((host, stamp));
    }
    Ok(out)
}
