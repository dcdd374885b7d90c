//! Token-budget filtering and per-client diagnostics

use crate::error::Result;
use crate::partition::client_label;
use crate::records::PreferenceRecord;
use crate::tokenizer::Tokenize;
use comfy_table::Table;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use tracing::info;

/// Combined token length of the instruction and both responses.
pub fn record_num_tokens<T: Tokenize + ?Sized>(
    record: &PreferenceRecord,
    tokenizer: &T,
) -> Result<usize> {
    Ok(tokenizer.num_tokens(&record.instruction)?
        + tokenizer.num_tokens(&record.output_a)?
        + tokenizer.num_tokens(&record.output_b)?)
}

/// Keeps the records whose combined length is at most `max_tokens`.
///
/// The SHP pipeline applies this to the train split only.
pub fn filter_by_budget<T: Tokenize + ?Sized>(
    records: Vec<PreferenceRecord>,
    tokenizer: &T,
    max_tokens: usize,
) -> Result<Vec<PreferenceRecord>> {
    let before = records.len();
    let mut kept = Vec::with_capacity(before);
    for record in records {
        if record_num_tokens(&record, tokenizer)? <= max_tokens {
            kept.push(record);
        }
    }
    info!(
        before,
        after = kept.len(),
        max_tokens,
        "filtered records by token budget"
    );
    Ok(kept)
}

/// Sample counts per client and per source domain.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientDomainSummary {
    counts: BTreeMap<usize, BTreeMap<String, usize>>,
}

impl ClientDomainSummary {
    /// Counts enriched records (`category == Client_{i}`, `domain` set) for
    /// clients `0..num_clients`.
    pub fn from_records(records: &[PreferenceRecord], num_clients: usize) -> Self {
        let mut counts = BTreeMap::new();
        for client in 0..num_clients {
            let label = client_label(client);
            let by_domain: &mut BTreeMap<String, usize> = counts.entry(client).or_default();
            for record in records.iter().filter(|r| r.category == label) {
                let domain = record.domain.as_deref().unwrap_or("unknown");
                *by_domain.entry(domain.to_string()).or_insert(0) += 1;
            }
        }
        Self { counts }
    }

    pub fn count(&self, client: usize, domain: &str) -> usize {
        self.counts
            .get(&client)
            .and_then(|d| d.get(domain))
            .copied()
            .unwrap_or(0)
    }

    pub fn client_total(&self, client: usize) -> usize {
        self.counts
            .get(&client)
            .map(|d| d.values().sum())
            .unwrap_or(0)
    }

    pub fn log(&self) {
        info!("samples per client and domain:\n{self}");
    }
}

impl Display for ClientDomainSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let domains: BTreeSet<&String> = self.counts.values().flat_map(|d| d.keys()).collect();

        let mut table = Table::new();
        let mut header = vec!["client".to_string()];
        header.extend(domains.iter().map(|d| d.to_string()));
        header.push("total".to_string());
        table.set_header(header);

        for (client, by_domain) in self.counts.iter() {
            let mut row = vec![client_label(*client)];
            row.extend(
                domains
                    .iter()
                    .map(|d| by_domain.get(*d).copied().unwrap_or(0).to_string()),
            );
            row.push(self.client_total(*client).to_string());
            table.add_row(row);
        }
        write!(f, "{table}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tests::WhitespaceTokenizer;
    use anyhow::Result;
    use rstest::*;

    fn words(n: usize) -> String {
        vec!["w"; n].join(" ")
    }

    #[fixture]
    fn records() -> Vec<PreferenceRecord> {
        vec![
            PreferenceRecord::new(&words(200), &words(200), &words(112), 0, "askscience"),
            PreferenceRecord::new(&words(200), &words(200), &words(113), 1, "askscience"),
            PreferenceRecord::new(&words(1), &words(1), &words(1), 1, "askculinary"),
        ]
    }

    #[rstest]
    fn test_budget_is_inclusive(records: Vec<PreferenceRecord>) -> Result<()> {
        let tokenizer = WhitespaceTokenizer;
        let kept = filter_by_budget(records.clone(), &tokenizer, 512)?;

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0], records[0]);
        assert_eq!(kept[1], records[2]);
        for record in kept.iter() {
            assert!(record_num_tokens(record, &tokenizer)? <= 512);
        }
        assert!(record_num_tokens(&records[1], &tokenizer)? > 512);
        Ok(())
    }

    #[rstest]
    fn test_client_domain_summary() {
        let mut a = PreferenceRecord::new("a", "x", "y", 0, "Client_0");
        a.domain = Some("askscience".to_string());
        let mut b = PreferenceRecord::new("b", "x", "y", 0, "Client_0");
        b.domain = Some("askculinary".to_string());
        let mut c = PreferenceRecord::new("c", "x", "y", 0, "Client_1");
        c.domain = Some("askscience".to_string());

        let summary = ClientDomainSummary::from_records(&[a, b.clone(), b, c], 3);

        assert_eq!(summary.count(0, "askculinary"), 2);
        assert_eq!(summary.count(1, "askscience"), 1);
        assert_eq!(summary.client_total(0), 3);
        assert_eq!(summary.client_total(2), 0);
        let rendered = summary.to_string();
        assert!(rendered.contains("Client_2"));
        assert!(rendered.contains("askculinary"));
    }
}
