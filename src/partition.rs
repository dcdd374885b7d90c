//! Category coding and federated client assignment
//!
//! Unique instructions are coded by category and handed to a `Splitter`,
//! which spreads them over simulated clients. Assignment is by instruction,
//! so every comparison sharing an instruction lands on the same client.

use crate::error::{PipelineError, Result};
use crate::records::{InstructionRecord, PreferenceRecord};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rand_distr::{Dirichlet, Distribution};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// Synthetic category label given to records of client `idx`.
pub fn client_label(idx: usize) -> String {
    format!("Client_{idx}")
}

/// Category string to dense integer code.
///
/// Codes follow the sorted order of the category strings (or the order of
/// an externally supplied list), never the order records were seen in.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryVocab {
    categories: Vec<String>,
    index: HashMap<String, usize>,
}

impl CategoryVocab {
    pub fn from_categories<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Self {
            categories: vec![],
            index: HashMap::new(),
        };
        for category in categories {
            let category = category.into();
            if !vocab.index.contains_key(&category) {
                vocab.index.insert(category.clone(), vocab.categories.len());
                vocab.categories.push(category);
            }
        }
        vocab
    }

    pub fn from_records(records: &[InstructionRecord]) -> Self {
        let sorted: BTreeSet<&str> = records.iter().map(|r| r.category.as_str()).collect();
        Self::from_categories(sorted)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn code(&self, category: &str) -> Option<usize> {
        self.index.get(category).copied()
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Fills `categories` on every record.
    pub fn assign_codes(&self, records: &mut [InstructionRecord]) -> Result<()> {
        for record in records.iter_mut() {
            let code = self.code(&record.category).ok_or_else(|| {
                PipelineError::validation(format!(
                    "category `{}` is not in the vocabulary",
                    record.category
                ))
            })?;
            record.categories = Some(code);
        }
        Ok(())
    }
}

/// Splits item indices over clients given one label per item.
pub trait Splitter {
    /// Returns `num_clients` lists of indices into `labels`.
    fn split(&self, labels: &[usize], num_clients: usize) -> Result<Vec<Vec<usize>>>;
}

/// Label-skewed (LDA) split: for every label the items are divided among
/// clients by proportions drawn from `Dirichlet(alpha)`. Clients already
/// holding their fair share get no more items. Sampling repeats until each
/// client has at least `min_size` items.
#[derive(Debug, Clone)]
pub struct DirichletSplitter {
    alpha: f64,
    min_size: usize,
    seed: u64,
    max_attempts: usize,
}

impl DirichletSplitter {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            min_size: 1,
            seed: 42,
            max_attempts: 1_000,
        }
    }

    pub fn min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn proportions(
        &self,
        dirichlet: &Dirichlet<f64>,
        slices: &[Vec<usize>],
        capacity: f64,
        rng: &mut StdRng,
    ) -> Vec<f64> {
        let open: Vec<bool> = slices.iter().map(|s| (s.len() as f64) < capacity).collect();
        let mut props: Vec<f64> = dirichlet.sample(rng);
        for (p, &is_open) in props.iter_mut().zip(open.iter()) {
            if !is_open {
                *p = 0.0;
            }
        }
        let mut total: f64 = props.iter().sum();
        if total.is_nan() || total <= 0.0 {
            // degenerate draw: spread evenly over the clients with room left
            let any_open = open.contains(&true);
            props = open
                .iter()
                .map(|&is_open| if is_open || !any_open { 1.0 } else { 0.0 })
                .collect();
            total = props.iter().sum();
        }
        props.iter_mut().for_each(|p| *p /= total);
        props
    }
}

impl Splitter for DirichletSplitter {
    fn split(&self, labels: &[usize], num_clients: usize) -> Result<Vec<Vec<usize>>> {
        if num_clients == 0 {
            return Err(PipelineError::validation("num_clients must be positive"));
        }
        if self.alpha <= 0.0 {
            return Err(PipelineError::validation(format!(
                "alpha must be positive, got {}",
                self.alpha
            )));
        }
        let n = labels.len();
        if n < self.min_size * num_clients {
            return Err(PipelineError::validation(format!(
                "{n} items cannot give {num_clients} clients at least {} each",
                self.min_size
            )));
        }
        if num_clients == 1 {
            return Ok(vec![(0..n).collect()]);
        }

        let mut by_label: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (idx, &label) in labels.iter().enumerate() {
            by_label.entry(label).or_default().push(idx);
        }

        let dirichlet = Dirichlet::new(&vec![self.alpha; num_clients])
            .map_err(|e| PipelineError::validation(format!("invalid Dirichlet prior: {e:?}")))?;
        let capacity = n as f64 / num_clients as f64;
        let mut rng = StdRng::seed_from_u64(self.seed);

        for attempt in 1..=self.max_attempts {
            let mut slices: Vec<Vec<usize>> = vec![vec![]; num_clients];
            for indices in by_label.values() {
                let mut indices = indices.clone();
                indices.shuffle(&mut rng);
                let props = self.proportions(&dirichlet, &slices, capacity, &mut rng);

                // the last client with a share takes the rounding remainder
                let last = props.iter().rposition(|&p| p > 0.0).unwrap_or(num_clients - 1);
                let len = indices.len();
                let mut start = 0_usize;
                let mut cumulative = 0_f64;
                for (client, p) in props.iter().enumerate() {
                    cumulative += p;
                    let end = match client.cmp(&last) {
                        Ordering::Less => ((cumulative * len as f64) as usize).clamp(start, len),
                        Ordering::Equal => len,
                        Ordering::Greater => start,
                    };
                    slices[client].extend_from_slice(&indices[start..end]);
                    start = end;
                }
            }

            let smallest = slices.iter().map(Vec::len).min().unwrap_or(0);
            if smallest >= self.min_size {
                debug!(attempt, smallest, "dirichlet split accepted");
                for slice in slices.iter_mut() {
                    slice.shuffle(&mut rng);
                }
                return Ok(slices);
            }
        }

        Err(PipelineError::validation(format!(
            "no split with at least {} items per client after {} attempts",
            self.min_size, self.max_attempts
        )))
    }
}

/// Instruction to client index, built once per partitioning run.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientAssignment {
    num_clients: usize,
    clients: HashMap<String, usize>,
}

impl ClientAssignment {
    pub fn num_clients(&self) -> usize {
        self.num_clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn client_of(&self, instruction: &str) -> Result<usize> {
        self.clients
            .get(instruction)
            .copied()
            .ok_or_else(|| PipelineError::UnassignedInstruction(instruction.to_string()))
    }

    /// Number of instructions held by each client.
    pub fn client_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0_usize; self.num_clients];
        for &client in self.clients.values() {
            sizes[client] += 1;
        }
        sizes
    }
}

/// Assigns each coded instruction to a client using `splitter`.
pub fn partition(
    instructions: &[InstructionRecord],
    num_clients: usize,
    splitter: &dyn Splitter,
) -> Result<ClientAssignment> {
    let labels = instructions
        .iter()
        .map(|r| {
            r.categories.ok_or_else(|| {
                PipelineError::validation(format!(
                    "instruction has no category code: {:?}",
                    r.instruction
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let slices = splitter.split(&labels, num_clients)?;
    if slices.len() != num_clients {
        return Err(PipelineError::validation(format!(
            "splitter returned {} client lists, expected {num_clients}",
            slices.len()
        )));
    }

    let mut assigned = vec![false; instructions.len()];
    let mut clients = HashMap::with_capacity(instructions.len());
    for (client, slice) in slices.iter().enumerate() {
        for &idx in slice {
            let seen = assigned.get_mut(idx).ok_or_else(|| {
                PipelineError::validation(format!("splitter returned out-of-range index {idx}"))
            })?;
            if *seen {
                return Err(PipelineError::validation(format!(
                    "splitter assigned index {idx} to more than one client"
                )));
            }
            *seen = true;
            clients.insert(instructions[idx].instruction.clone(), client);
        }
    }

    let assignment = ClientAssignment {
        num_clients,
        clients,
    };
    info!(sizes = ?assignment.client_sizes(), "assigned instructions to clients");
    Ok(assignment)
}

/// Moves each record's category to `domain` and relabels it with its client.
pub fn enrich(
    records: Vec<PreferenceRecord>,
    assignment: &ClientAssignment,
) -> Result<Vec<PreferenceRecord>> {
    records
        .into_iter()
        .map(|mut record| {
            let client = assignment.client_of(&record.instruction)?;
            record.domain = Some(std::mem::replace(
                &mut record.category,
                client_label(client),
            ));
            Ok(record)
        })
        .collect()
}
