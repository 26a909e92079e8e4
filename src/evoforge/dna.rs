//! Agent DNA: trait algebra, crossover, mutation, and selection.
//!
//! Everything in this module is a pure value operation: no I/O, no clocks
//! beyond birth timestamps, and every random choice flows through a caller
//! supplied [`Rng`] so tests can seed a [`rand::rngs::StdRng`] and get
//! reproducible genetics.
//!
//! The four behavioural traits live in `[0, 1]`; arithmetic is always
//! followed by clamping back into that interval.
//!
//! # Example
//!
//! ```rust
//! use evoforge::dna::{crossover_with_weight, genetic_distance, TraitVector};
//!
//! let a = TraitVector { creativity: 1.0, precision: 0.0, speed: 0.5, collaboration: 0.5 };
//! let b = TraitVector { creativity: 0.0, precision: 1.0, speed: 0.5, collaboration: 0.5 };
//!
//! let child = crossover_with_weight(&a, &b, 0.5);
//! assert!((child.creativity - 0.5).abs() < 1e-9);
//! assert!((genetic_distance(&a, &b) - 0.5).abs() < 1e-9);
//! ```

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Crossover weight lower bound.
pub const CROSSOVER_WEIGHT_MIN: f64 = 0.3;
/// Crossover weight upper bound.
pub const CROSSOVER_WEIGHT_MAX: f64 = 0.7;
/// Half-width of the uniform noise applied by [`mutate`].
pub const MUTATION_NOISE: f64 = 0.2;

/// Clamp a scalar into the `[0, 1]` trait interval.
pub fn clamp_unit(value: f64) -> f64 {
    if value < 0.0 {
        0.0
    } else if value > 1.0 {
        1.0
    } else {
        value
    }
}

/// The four behavioural scalars every agent carries.
///
/// Missing entries deserialize to `0.5`, the neutral midpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraitVector {
    pub creativity: f64,
    pub precision: f64,
    pub speed: f64,
    pub collaboration: f64,
}

impl Default for TraitVector {
    fn default() -> Self {
        Self {
            creativity: 0.5,
            precision: 0.5,
            speed: 0.5,
            collaboration: 0.5,
        }
    }
}

/// Names of the individual traits, used for targeted adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraitKind {
    Creativity,
    Precision,
    Speed,
    Collaboration,
}

impl TraitVector {
    /// Return a copy with every trait clamped into `[0, 1]`.
    pub fn clamped(self) -> Self {
        Self {
            creativity: clamp_unit(self.creativity),
            precision: clamp_unit(self.precision),
            speed: clamp_unit(self.speed),
            collaboration: clamp_unit(self.collaboration),
        }
    }

    /// Return a copy with `delta` added to one trait, clamped.
    pub fn adjusted(mut self, kind: TraitKind, delta: f64) -> Self {
        match kind {
            TraitKind::Creativity => self.creativity += delta,
            TraitKind::Precision => self.precision += delta,
            TraitKind::Speed => self.speed += delta,
            TraitKind::Collaboration => self.collaboration += delta,
        }
        self.clamped()
    }

    /// The traits as a fixed-order array (creativity, precision, speed,
    /// collaboration).
    pub fn as_array(&self) -> [f64; 4] {
        [self.creativity, self.precision, self.speed, self.collaboration]
    }

    /// Component-wise mean of a set of vectors; the neutral default for an
    /// empty set.
    pub fn average<'a, I>(vectors: I) -> TraitVector
    where
        I: IntoIterator<Item = &'a TraitVector>,
    {
        let mut sum = [0.0f64; 4];
        let mut count = 0usize;
        for v in vectors {
            let a = v.as_array();
            for (slot, value) in sum.iter_mut().zip(a.iter()) {
                *slot += value;
            }
            count += 1;
        }
        if count == 0 {
            return TraitVector::default();
        }
        let n = count as f64;
        TraitVector {
            creativity: sum[0] / n,
            precision: sum[1] / n,
            speed: sum[2] / n,
            collaboration: sum[3] / n,
        }
    }

    /// Human-readable profile used when composing agent prompts.
    pub fn describe(&self) -> String {
        format!(
            "creativity {:.2}, precision {:.2}, speed {:.2}, collaboration {:.2}",
            self.creativity, self.precision, self.speed, self.collaboration
        )
    }
}

/// Capability tags an agent's DNA may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Ideation,
    Simulation,
    Critique,
    Synthesis,
    Optimization,
    Research,
}

impl Capability {
    /// The trait a specialist of this capability is nudged on.
    pub fn dominant_trait(self) -> TraitKind {
        match self {
            Capability::Ideation => TraitKind::Creativity,
            Capability::Simulation => TraitKind::Precision,
            Capability::Critique => TraitKind::Precision,
            Capability::Synthesis => TraitKind::Collaboration,
            Capability::Optimization => TraitKind::Speed,
            Capability::Research => TraitKind::Precision,
        }
    }

    /// Lower-snake-case name as it appears on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Ideation => "ideation",
            Capability::Simulation => "simulation",
            Capability::Critique => "critique",
            Capability::Synthesis => "synthesis",
            Capability::Optimization => "optimization",
            Capability::Research => "research",
        }
    }

    /// Parse a lower-snake-case capability name.
    pub fn parse(name: &str) -> Option<Capability> {
        match name.trim() {
            "ideation" => Some(Capability::Ideation),
            "simulation" => Some(Capability::Simulation),
            "critique" => Some(Capability::Critique),
            "synthesis" => Some(Capability::Synthesis),
            "optimization" => Some(Capability::Optimization),
            "research" => Some(Capability::Research),
            _ => None,
        }
    }
}

/// The kind of change recorded in a DNA mutation log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    TraitAdjustment,
    CapabilityAddition,
    ToolAddition,
    InstructionModification,
}

/// One append-only entry in a DNA mutation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub delta: serde_json::Value,
}

/// The heritable record behind every agent.
///
/// Immutable once created: breeding and specialist spawning construct *new*
/// DNA rather than editing existing records.  The mutation log describes how
/// this record came to differ from its parents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDna {
    /// Globally unique within a run.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    pub traits: TraitVector,
    pub capabilities: BTreeSet<Capability>,
    /// Opaque oracle model identifier.
    pub model: String,
    /// Instruction template injected into every prompt this agent builds.
    pub instructions: String,
    /// Opaque tool references; carried but unused by the core.
    pub tools: Vec<String>,
    /// 0 for roots, `max(parent.generation) + 1` otherwise.
    pub generation: u32,
    /// 0 entries for roots, 1–2 for spawned agents.
    pub parent_ids: Vec<String>,
    pub birth: DateTime<Utc>,
    pub mutations: Vec<MutationRecord>,
}

impl AgentDna {
    /// Create root DNA (generation 0, no parents).
    pub fn root(
        name: impl Into<String>,
        traits: TraitVector,
        capabilities: impl IntoIterator<Item = Capability>,
        model: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            traits: traits.clamped(),
            capabilities: capabilities.into_iter().collect(),
            model: model.into(),
            instructions: instructions.into(),
            tools: Vec::new(),
            generation: 0,
            parent_ids: Vec::new(),
            birth: Utc::now(),
            mutations: Vec::new(),
        }
    }
}

/// Weighted trait average with a caller-chosen weight.
///
/// `w` is the share inherited from `a`; the same weight applies to all four
/// traits, and the result is clamped.
pub fn crossover_with_weight(a: &TraitVector, b: &TraitVector, w: f64) -> TraitVector {
    TraitVector {
        creativity: a.creativity * w + b.creativity * (1.0 - w),
        precision: a.precision * w + b.precision * (1.0 - w),
        speed: a.speed * w + b.speed * (1.0 - w),
        collaboration: a.collaboration * w + b.collaboration * (1.0 - w),
    }
    .clamped()
}

/// Crossover with a single random weight in `[0.3, 0.7]`.
pub fn crossover(a: &TraitVector, b: &TraitVector, rng: &mut impl Rng) -> TraitVector {
    let w = rng.random_range(CROSSOVER_WEIGHT_MIN..=CROSSOVER_WEIGHT_MAX);
    crossover_with_weight(a, b, w)
}

/// Independently perturb each trait with probability `rate`, adding uniform
/// noise in `[-0.2, +0.2]` and clamping.
pub fn mutate(traits: &TraitVector, rate: f64, rng: &mut impl Rng) -> TraitVector {
    let rate = rate.max(0.0).min(1.0);
    let mut out = *traits;
    let fields: [&mut f64; 4] = [
        &mut out.creativity,
        &mut out.precision,
        &mut out.speed,
        &mut out.collaboration,
    ];
    for field in fields {
        if rng.random_bool(rate) {
            let noise = rng.random_range(-MUTATION_NOISE..=MUTATION_NOISE);
            *field = clamp_unit(*field + noise);
        }
    }
    out
}

/// Breed two parents into a new DNA record: crossover, then mutation, then a
/// union of capabilities and tools.
///
/// The child's generation is `max(parent generations) + 1`, its name is a
/// deterministic composition of the parent names, and its instructions blend
/// both parents' instruction summaries with the child's trait profile.
pub fn breed(p1: &AgentDna, p2: &AgentDna, mutation_rate: f64, rng: &mut impl Rng) -> AgentDna {
    let w = rng.random_range(CROSSOVER_WEIGHT_MIN..=CROSSOVER_WEIGHT_MAX);
    let crossed = crossover_with_weight(&p1.traits, &p2.traits, w);
    let traits = mutate(&crossed, mutation_rate, rng);
    let generation = p1.generation.max(p2.generation) + 1;

    let capabilities: BTreeSet<Capability> = p1
        .capabilities
        .union(&p2.capabilities)
        .cloned()
        .collect();
    let mut tools: Vec<String> = p1.tools.clone();
    for tool in &p2.tools {
        if !tools.contains(tool) {
            tools.push(tool.clone());
        }
    }

    let name = format!(
        "{}-{} G{}",
        first_token(&p1.name),
        first_token(&p2.name),
        generation
    );
    let instructions = format!(
        "Hybrid of {} and {}.\n\nInherited from {}: {}\nInherited from {}: {}\n\nTrait profile: {}.",
        p1.name,
        p2.name,
        p1.name,
        summarize(&p1.instructions),
        p2.name,
        summarize(&p2.instructions),
        traits.describe()
    );

    let now = Utc::now();
    let mut mutations = vec![MutationRecord {
        kind: MutationKind::TraitAdjustment,
        timestamp: now,
        description: format!(
            "crossover of {} and {} (weight {:.3}) with mutation rate {:.2}",
            p1.name, p2.name, w, mutation_rate
        ),
        delta: serde_json::json!({
            "crossover_weight": w,
            "mutation_rate": mutation_rate,
            "traits": traits,
        }),
    }];

    let added: Vec<&'static str> = capabilities
        .iter()
        .filter(|c| !p1.capabilities.contains(*c))
        .map(|c| c.as_str())
        .collect();
    if !added.is_empty() {
        mutations.push(MutationRecord {
            kind: MutationKind::CapabilityAddition,
            timestamp: now,
            description: format!("merged capabilities from {}", p2.name),
            delta: serde_json::json!({ "added": added }),
        });
    }

    AgentDna {
        id: Uuid::new_v4().to_string(),
        name,
        traits,
        capabilities,
        model: p1.model.clone(),
        instructions,
        tools,
        generation,
        parent_ids: vec![p1.id.clone(), p2.id.clone()],
        birth: now,
        mutations,
    }
}

fn first_token(name: &str) -> &str {
    name.split_whitespace().next().unwrap_or(name)
}

fn summarize(instructions: &str) -> &str {
    let trimmed = instructions.trim();
    match trimmed.char_indices().nth(140) {
        Some((idx, _)) => &trimmed[..idx],
        None => trimmed,
    }
}

/// Mean absolute per-trait difference, normalized into `[0, 1]`.
pub fn genetic_distance(a: &TraitVector, b: &TraitVector) -> f64 {
    let pa = a.as_array();
    let pb = b.as_array();
    pa.iter()
        .zip(pb.iter())
        .map(|(x, y)| (x - y).abs())
        .sum::<f64>()
        / 4.0
}

/// Mean pairwise genetic distance across a population; `0.0` for populations
/// of size 0 or 1.
pub fn diversity(population: &[TraitVector]) -> f64 {
    let n = population.len();
    if n <= 1 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..n {
        for j in (i + 1)..n {
            total += genetic_distance(&population[i], &population[j]);
            pairs += 1;
        }
    }
    total / pairs as f64
}

/// Tournament selection: draw `k` uniform entrants and return the index of
/// the fittest.  `None` for an empty fitness slice.
pub fn tournament_select(fitness: &[f64], k: usize, rng: &mut impl Rng) -> Option<usize> {
    if fitness.is_empty() {
        return None;
    }
    let k = k.max(1);
    let mut best = rng.random_range(0..fitness.len());
    for _ in 1..k {
        let candidate = rng.random_range(0..fitness.len());
        if fitness[candidate] > fitness[best] {
            best = candidate;
        }
    }
    Some(best)
}

/// Roulette-wheel selection: probability proportional to fitness, falling
/// back to a uniform draw when total fitness is zero (or negative).
pub fn roulette_select(fitness: &[f64], rng: &mut impl Rng) -> Option<usize> {
    if fitness.is_empty() {
        return None;
    }
    let total: f64 = fitness.iter().map(|f| f.max(0.0)).sum();
    if total <= 0.0 {
        return Some(rng.random_range(0..fitness.len()));
    }
    let mut spin = rng.random_range(0.0..total);
    for (idx, f) in fitness.iter().enumerate() {
        spin -= f.max(0.0);
        if spin <= 0.0 {
            return Some(idx);
        }
    }
    Some(fitness.len() - 1)
}

/// Rank selection: probability proportional to the 1-based rank after
/// sorting by fitness ascending, so the fittest gets weight `n`.
pub fn rank_select(fitness: &[f64], rng: &mut impl Rng) -> Option<usize> {
    let n = fitness.len();
    if n == 0 {
        return None;
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        fitness[a]
            .partial_cmp(&fitness[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let total = (n * (n + 1) / 2) as f64;
    let mut spin = rng.random_range(0.0..total);
    for (rank0, &idx) in order.iter().enumerate() {
        spin -= (rank0 + 1) as f64;
        if spin <= 0.0 {
            return Some(idx);
        }
    }
    Some(order[n - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn extreme() -> (TraitVector, TraitVector) {
        (
            TraitVector {
                creativity: 1.0,
                precision: 0.0,
                speed: 1.0,
                collaboration: 0.0,
            },
            TraitVector {
                creativity: 0.0,
                precision: 1.0,
                speed: 0.0,
                collaboration: 1.0,
            },
        )
    }

    #[test]
    fn missing_traits_default_to_midpoint() {
        let v: TraitVector = serde_json::from_str("{\"creativity\": 0.9}").unwrap();
        assert!((v.creativity - 0.9).abs() < 1e-9);
        assert!((v.precision - 0.5).abs() < 1e-9);
        assert!((v.collaboration - 0.5).abs() < 1e-9);
    }

    #[test]
    fn crossover_weight_stays_in_band() {
        let (a, b) = extreme();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let child = crossover(&a, &b, &mut rng);
            // creativity equals the sampled weight for these extremes
            assert!(child.creativity >= CROSSOVER_WEIGHT_MIN - 1e-9);
            assert!(child.creativity <= CROSSOVER_WEIGHT_MAX + 1e-9);
        }
    }

    #[test]
    fn mutate_keeps_traits_in_unit_interval() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut current = TraitVector {
            creativity: 0.98,
            precision: 0.02,
            speed: 0.5,
            collaboration: 0.5,
        };
        for _ in 0..500 {
            current = mutate(&current, 1.0, &mut rng);
            for value in current.as_array().iter() {
                assert!(*value >= 0.0 && *value <= 1.0);
            }
        }
    }

    #[test]
    fn distance_is_symmetric_reflexive_and_bounded() {
        let (a, b) = extreme();
        assert!((genetic_distance(&a, &a)).abs() < 1e-9);
        assert!((genetic_distance(&a, &b) - genetic_distance(&b, &a)).abs() < 1e-9);
        assert!((genetic_distance(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn diversity_edge_cases() {
        assert_eq!(diversity(&[]), 0.0);
        assert_eq!(diversity(&[TraitVector::default()]), 0.0);
        let (a, b) = extreme();
        assert!((diversity(&[a, b]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn breed_sets_generation_and_parents() {
        let mut rng = StdRng::seed_from_u64(3);
        let p1 = AgentDna::root(
            "Prime Ideator",
            TraitVector::default(),
            vec![Capability::Ideation],
            "model-a",
            "Generate bold ideas.",
        );
        let mut p2 = AgentDna::root(
            "Prime Critic",
            TraitVector::default(),
            vec![Capability::Critique],
            "model-b",
            "Find every flaw.",
        );
        p2.generation = 2;

        let child = breed(&p1, &p2, 0.1, &mut rng);
        assert_eq!(child.generation, 3);
        assert_eq!(child.parent_ids, vec![p1.id.clone(), p2.id.clone()]);
        assert!(child.capabilities.contains(&Capability::Ideation));
        assert!(child.capabilities.contains(&Capability::Critique));
        assert!(child.name.contains("G3"));
        assert!(!child.mutations.is_empty());
        assert!(child.birth >= p1.birth);
    }

    #[test]
    fn tournament_prefers_fitter_entrants() {
        let mut rng = StdRng::seed_from_u64(5);
        let fitness = [0.1, 0.9, 0.2];
        let mut wins = [0usize; 3];
        for _ in 0..300 {
            wins[tournament_select(&fitness, 3, &mut rng).unwrap()] += 1;
        }
        assert!(wins[1] > wins[0]);
        assert!(wins[1] > wins[2]);
    }

    #[test]
    fn roulette_falls_back_to_uniform_on_zero_fitness() {
        let mut rng = StdRng::seed_from_u64(13);
        let fitness = [0.0, 0.0, 0.0];
        let mut seen = [false; 3];
        for _ in 0..200 {
            seen[roulette_select(&fitness, &mut rng).unwrap()] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn rank_select_covers_all_indices() {
        let mut rng = StdRng::seed_from_u64(17);
        let fitness = [0.2, 0.8, 0.4];
        let mut seen = [false; 3];
        for _ in 0..500 {
            seen[rank_select(&fitness, &mut rng).unwrap()] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn selection_on_empty_slice_returns_none() {
        let mut rng = StdRng::seed_from_u64(19);
        assert!(tournament_select(&[], 3, &mut rng).is_none());
        assert!(roulette_select(&[], &mut rng).is_none());
        assert!(rank_select(&[], &mut rng).is_none());
    }
}
