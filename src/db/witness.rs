//! Witness ledger: best known and best excluded permutation counts per (n, waste).
//!
//! Invariants held by every function here:
//! - `perms` never decreases.
//! - `excl_perms` never increases once set.
//! - `final` never reverts.

use super::{Database, now_ms};
use crate::perms::{count_permutations, factorial};
use crate::types::WitnessRecord;
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::fmt;
use tracing::{info, warn};

fn parse_witness_row(row: &Row) -> rusqlite::Result<WitnessRecord> {
    Ok(WitnessRecord {
        n: row.get("n")?,
        waste: row.get("waste")?,
        perms: row.get("perms")?,
        str: row.get("str")?,
        excl_perms: row.get("excl_perms")?,
        is_final: row.get::<_, i64>("final")? != 0,
        team: row.get("team")?,
        updated_at: row.get("updated_at")?,
    })
}

pub(crate) fn get_witness_internal(
    conn: &Connection,
    n: i64,
    waste: i64,
) -> Result<Option<WitnessRecord>> {
    Ok(conn
        .query_row(
            "SELECT n, waste, perms, str, excl_perms, final, team, updated_at
             FROM witness_strings WHERE n = ?1 AND waste = ?2",
            params![n, waste],
            parse_witness_row,
        )
        .optional()?)
}

fn set_bound(conn: &Connection, n: i64, waste: i64, excl: Option<i64>, is_final: bool) -> Result<()> {
    conn.execute(
        "UPDATE witness_strings SET excl_perms = ?3, final = ?4, updated_at = ?5
         WHERE n = ?1 AND waste = ?2",
        params![n, waste, excl, is_final as i64, now_ms()],
    )?;
    Ok(())
}

/// Cap (n, waste)'s exclusion bound at `cap` if that is tighter.
pub(crate) fn cap_exclusion(conn: &Connection, n: i64, waste: i64, cap: i64) -> Result<()> {
    let Some(record) = get_witness_internal(conn, n, waste)? else {
        return Ok(());
    };
    if record.excl_perms.is_none_or(|excl| cap < excl) {
        let is_final = record.is_final || cap == record.perms + 1;
        info!(n, waste, cap, is_final, "Tightened exclusion bound");
        set_bound(conn, n, waste, Some(cap), is_final)?;
    }
    Ok(())
}

/// Apply the cap a finalized (n, waste - 1) implies: one more character adds
/// at most n + 1 permutations.
fn cap_from_previous_waste(conn: &Connection, n: i64, waste: i64) -> Result<()> {
    if waste < 1 {
        return Ok(());
    }
    if let Some(previous) = get_witness_internal(conn, n, waste - 1)?
        && previous.is_final
    {
        cap_exclusion(conn, n, waste, previous.perms + n + 1)?;
    }
    Ok(())
}

/// Store a generation's collective bound. Returns the updated record, or
/// `None` when nothing has been witnessed for (n, waste).
pub(crate) fn apply_generation_bound(
    conn: &Connection,
    n: i64,
    waste: i64,
    ruled_out: i64,
) -> Result<Option<WitnessRecord>> {
    let Some(mut record) = get_witness_internal(conn, n, waste)? else {
        return Ok(None);
    };
    let excl = match record.excl_perms {
        Some(existing) if record.is_final => existing,
        Some(existing) => existing.min(ruled_out),
        None => ruled_out,
    };
    let is_final = record.is_final || excl == record.perms + 1;
    set_bound(conn, n, waste, Some(excl), is_final)?;
    record.excl_perms = Some(excl);
    record.is_final = is_final;

    if is_final {
        cap_exclusion(conn, n, waste + 1, record.perms + n + 1)?;
    }
    Ok(Some(record))
}

/// Reply from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerReply {
    /// Best permutation count now held for (n, waste); -1 when nothing is known.
    Best { n: i64, waste: i64, perms: i64 },
    BoundNotAbovePerms { bound: i64, perms: i64 },
    ContradictsBound { perms: i64, excl: i64 },
}

impl fmt::Display for LedgerReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerReply::Best { n, waste, perms } => writeln!(f, "({}, {}, {})", n, waste, perms),
            LedgerReply::BoundNotAbovePerms { bound, perms } => writeln!(
                f,
                "Error: Trying to set permutations ruled out to {} while exhibiting a string with {} permutations",
                bound, perms
            ),
            LedgerReply::ContradictsBound { perms, excl } => writeln!(
                f,
                "Error: A string with {} permutations contradicts the proven exclusion of {}",
                perms, excl
            ),
        }
    }
}

/// A witness submitted with the client's identity.
#[derive(Debug, Clone, Copy)]
pub struct WitnessSubmission<'a> {
    pub n: i64,
    pub waste: i64,
    /// -1 queries without mutating.
    pub perms: i64,
    pub str: &'a str,
    pub proven_bound: Option<i64>,
    pub team: &'a str,
    pub ip: &'a str,
}

/// Record a witness inside an open transaction.
pub(crate) fn record_witness_internal(
    conn: &Connection,
    sub: &WitnessSubmission<'_>,
) -> Result<LedgerReply> {
    let (n, waste, p) = (sub.n, sub.waste, sub.perms);
    let bound = sub.proven_bound.filter(|&b| b > 0);
    if let Some(bound) = bound
        && bound <= p
    {
        return Ok(LedgerReply::BoundNotAbovePerms { bound, perms: p });
    }

    let existing = get_witness_internal(conn, n, waste)?;
    if p < 0 {
        let perms = existing.map_or(-1, |r| r.perms);
        return Ok(LedgerReply::Best { n, waste, perms });
    }
    if let Some(excl) = existing.as_ref().and_then(|r| r.excl_perms)
        && p >= excl
    {
        warn!(n, waste, perms = p, excl, "Witness contradicts proven bound");
        return Ok(LedgerReply::ContradictsBound { perms: p, excl });
    }

    let now = now_ms();
    if p == factorial(n) {
        conn.execute(
            "INSERT INTO superperms (n, waste, perms, str, ip, team, found_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![n, waste, p, sub.str, sub.ip, sub.team, now],
        )?;
        info!(n, waste, team = sub.team, "Superpermutation logged");
    }

    let best = match existing {
        None => {
            let is_final = bound == Some(p + 1);
            conn.execute(
                "INSERT INTO witness_strings (n, waste, perms, str, excl_perms, final, team, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![n, waste, p, sub.str, bound, is_final as i64, sub.team, now],
            )?;
            info!(n, waste, perms = p, "New witness record");
            p
        }
        Some(record) if p > record.perms => {
            let excl = match (bound, record.excl_perms) {
                (Some(b), Some(e)) => Some(b.min(e)),
                (Some(b), None) => Some(b),
                (None, e) => e,
            };
            let is_final = record.is_final || excl == Some(p + 1);
            conn.execute(
                "UPDATE witness_strings SET perms = ?3, str = ?4, team = ?5, excl_perms = ?6,
                     final = ?7, updated_at = ?8
                 WHERE n = ?1 AND waste = ?2",
                params![n, waste, p, sub.str, sub.team, excl, is_final as i64, now],
            )?;
            info!(n, waste, from = record.perms, to = p, "Improved witness record");
            p
        }
        Some(record) => record.perms,
    };

    cap_from_previous_waste(conn, n, waste)?;
    Ok(LedgerReply::Best {
        n,
        waste,
        perms: best,
    })
}

/// Reply to a `witnessString` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WitnessStringOutcome {
    Valid { perms: i64, ledger: LedgerReply },
    InvalidString,
    UnexpectedCount {
        perms: i64,
        expected: i64,
        waste: i64,
        len: usize,
    },
}

impl fmt::Display for WitnessStringOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WitnessStringOutcome::Valid { perms, ledger } => {
                write!(f, "Valid string with {} permutations\n{}", perms, ledger)
            }
            WitnessStringOutcome::InvalidString => writeln!(f, "Error: Invalid string"),
            WitnessStringOutcome::UnexpectedCount {
                perms,
                expected,
                waste,
                len,
            } => writeln!(
                f,
                "Error: Unexpected permutation count [{} permutations, expected {} for w={}, length={}]",
                perms, expected, waste, len
            ),
        }
    }
}

impl Database {
    /// Record a witness, or query with `perms == -1`.
    pub fn record_witness(&self, sub: &WitnessSubmission<'_>) -> Result<LedgerReply> {
        self.transact("recordWitness", |tx| record_witness_internal(tx, sub))
    }

    /// Verify a client-supplied string really has the claimed waste, then record it.
    pub fn witness_string(
        &self,
        n: i64,
        waste: i64,
        str: &str,
        proven_bound: Option<i64>,
        team: &str,
        ip: &str,
    ) -> Result<WitnessStringOutcome> {
        let Some(perms) = count_permutations(str, n) else {
            return Ok(WitnessStringOutcome::InvalidString);
        };
        let expected = str.len() as i64 - waste - n + 1;
        if perms != expected {
            return Ok(WitnessStringOutcome::UnexpectedCount {
                perms,
                expected,
                waste,
                len: str.len(),
            });
        }

        let ledger = self.record_witness(&WitnessSubmission {
            n,
            waste,
            perms,
            str,
            proven_bound,
            team,
            ip,
        })?;
        Ok(WitnessStringOutcome::Valid { perms, ledger })
    }

    /// Get the ledger record for (n, waste).
    pub fn get_witness(&self, n: i64, waste: i64) -> Result<Option<WitnessRecord>> {
        self.with_conn(|conn| get_witness_internal(conn, n, waste))
    }

    /// All ledger records, ordered by (n, waste).
    pub fn list_witnesses(&self) -> Result<Vec<WitnessRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT n, waste, perms, str, excl_perms, final, team, updated_at
                 FROM witness_strings ORDER BY n, waste",
            )?;
            let records = stmt
                .query_map([], parse_witness_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    /// Number of entries in the superpermutation log for `n`.
    pub fn superperm_count(&self, n: i64) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM superperms WHERE n = ?1",
                params![n],
                |row| row.get(0),
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit<'a>(n: i64, waste: i64, perms: i64, str: &'a str, bound: Option<i64>) -> WitnessSubmission<'a> {
        WitnessSubmission {
            n,
            waste,
            perms,
            str,
            proven_bound: bound,
            team: "anonymous",
            ip: "127.0.0.1",
        }
    }

    #[test]
    fn test_query_on_empty_ledger() {
        let db = Database::open_in_memory().unwrap();
        let reply = db.record_witness(&submit(4, 2, -1, "", None)).unwrap();
        assert_eq!(reply.to_string(), "(4, 2, -1)\n");
        assert!(db.get_witness(4, 2).unwrap().is_none());
    }

    #[test]
    fn test_bound_must_exceed_perms() {
        let db = Database::open_in_memory().unwrap();
        let reply = db
            .record_witness(&submit(4, 2, 12, "12341231423124312", Some(12)))
            .unwrap();
        assert_eq!(reply, LedgerReply::BoundNotAbovePerms { bound: 12, perms: 12 });
    }

    #[test]
    fn test_tight_bound_finalizes_on_insert() {
        let db = Database::open_in_memory().unwrap();
        db.record_witness(&submit(4, 2, 12, "12341231423124312", Some(13)))
            .unwrap();
        let record = db.get_witness(4, 2).unwrap().unwrap();
        assert_eq!(record.excl_perms, Some(13));
        assert!(record.is_final);
    }

    #[test]
    fn test_final_previous_waste_caps_next() {
        let db = Database::open_in_memory().unwrap();
        db.record_witness(&submit(4, 2, 12, "12341231423124312", Some(13)))
            .unwrap();
        // 12 + 4 + 1 = 17 caps waste 3
        db.record_witness(&submit(4, 3, 12, "123412314231243121", None))
            .unwrap();
        let record = db.get_witness(4, 3).unwrap().unwrap();
        assert_eq!(record.excl_perms, Some(17));
        assert!(!record.is_final);
    }

    #[test]
    fn test_witness_string_count_mismatch() {
        let db = Database::open_in_memory().unwrap();
        let outcome = db
            .witness_string(4, 3, "12341231423124312", None, "anonymous", "127.0.0.1")
            .unwrap();
        assert_eq!(
            outcome.to_string(),
            "Error: Unexpected permutation count [12 permutations, expected 11 for w=3, length=17]\n"
        );
    }
}
