// ABOUTME: Offline GTID set tools exposed on the command line
// ABOUTME: Union, subtract, cardinality, last and itemize over GTID set text

use crate::gtid;
use anyhow::{bail, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GtidOperation {
    /// Union of two or more sets
    Union(Vec<String>),
    Subtract { from: String, remove: String },
    Cardinality(String),
    Last { set: String, uuid: String },
    Itemize(String),
}

/// Output lines for one operation
pub fn evaluate(operation: &GtidOperation) -> Result<Vec<String>> {
    let lines = match operation {
        GtidOperation::Union(sets) => {
            if sets.len() < 2 {
                bail!("union needs at least two GTID sets");
            }
            let mut merged = gtid::GtidSet::new();
            for set in sets {
                merged = merged.union(&gtid::parse(set)?);
            }
            vec![merged.to_string()]
        }
        GtidOperation::Subtract { from, remove } => vec![gtid::subtract(from, remove)?],
        GtidOperation::Cardinality(set) => vec![gtid::cardinality(set)?.to_string()],
        GtidOperation::Last { set, uuid } => match gtid::last(set, uuid)? {
            Some(last) => vec![last.to_string()],
            None => bail!("uuid {} does not appear in the GTID set", uuid),
        },
        GtidOperation::Itemize(set) => gtid::itemize(set)?
            .into_iter()
            .flat_map(|(uuid, sequences)| {
                sequences
                    .into_iter()
                    .map(move |sequence| format!("{}:{}", uuid, sequence))
            })
            .collect(),
    };
    Ok(lines)
}

pub fn gtid(operation: GtidOperation) -> Result<()> {
    for line in evaluate(&operation)? {
        println!("{}", line);
    }
    Ok(())
}
