//! Weight and cohesion scoring.
//!
//! For each definition two package sets are collected from transitive
//! records: the *ideal* set, reached through the imports the definition uses,
//! and the *actual* set, reached through every import of its current file
//! (plus the ideal set). Each set is deduplicated by package label and summed;
//! the cohesion score is ideal / actual, or 1 when actual is negligible.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{CohesionConfig, WeightStrategy};
use crate::errors::CohesionResult;
use crate::graph::arena::GraphSource;
use crate::graph::packages::{DirectorySize, ManifestSize, PackageId, PackageIndex, WeightFunction};
use crate::indexer::interpreter::InterpreterInfo;
use crate::models::{DefinitionScore, ScoreReport, TransitiveImportRecord};

pub struct Scorer {
    index: Arc<PackageIndex>,
    weights: Box<dyn WeightFunction>,
    epsilon: f64,
}

impl Scorer {
    pub fn new(index: Arc<PackageIndex>, weights: Box<dyn WeightFunction>, epsilon: f64) -> Self {
        Self {
            index,
            weights,
            epsilon,
        }
    }

    /// Index the configured package roots (or the interpreter's when none
    /// are configured) and pick the configured weight function.
    pub fn from_config(config: &CohesionConfig) -> CohesionResult<Self> {
        let roots = if config.site_packages.is_empty() {
            InterpreterInfo::query(&config.python)?.existing_site_packages()
        } else {
            config.site_packages.clone()
        };
        Ok(Self::for_roots(&roots, config.weight_strategy, config.epsilon))
    }

    pub fn for_roots(roots: &[PathBuf], strategy: WeightStrategy, epsilon: f64) -> Self {
        let index = Arc::new(PackageIndex::build(roots));
        let weights: Box<dyn WeightFunction> = match strategy {
            WeightStrategy::PackageDirectory => Box::new(DirectorySize::new(roots)),
            WeightStrategy::Manifest => Box::new(ManifestSize::new(index.clone())),
        };
        Self::new(index, weights, epsilon)
    }

    pub fn index(&self) -> &PackageIndex {
        &self.index
    }

    /// `name==version` of the owning package, else the record's root.
    ///
    /// A module's declared version is not part of the fallback: submodules of
    /// one unindexed package disagree on it.
    pub fn package_label(&self, record: &TransitiveImportRecord) -> String {
        record
            .path
            .as_deref()
            .and_then(|p| self.index.resolve(Path::new(p)))
            .map(PackageId::label)
            .unwrap_or_else(|| record.root.clone())
    }

    /// Add the packages reached through `imports` to `packages`.
    ///
    /// A label keeps its largest weight; records without a file add nothing.
    fn collect<G: GraphSource + ?Sized>(
        &self,
        graph: &G,
        imports: &[usize],
        packages: &mut BTreeMap<String, u64>,
    ) {
        for &import in imports {
            for record in graph.import_records(import) {
                let Some(path) = record.path.as_deref() else {
                    continue;
                };
                let weight = self.weights.weight(Path::new(path));
                let entry = packages.entry(self.package_label(record)).or_insert(0);
                *entry = (*entry).max(weight);
            }
        }
    }

    pub fn score_definition<G: GraphSource + ?Sized>(&self, graph: &G, idx: usize) -> DefinitionScore {
        let file = graph.definition_file(idx);

        let mut ideal = BTreeMap::new();
        self.collect(graph, graph.definition_imports(idx), &mut ideal);
        let mut actual = ideal.clone();
        self.collect(graph, graph.file_imports(file), &mut actual);

        let ideal_weight: u64 = ideal.values().sum();
        let actual_weight: u64 = actual.values().sum();
        let cohesion_score = if (actual_weight as f64) < self.epsilon {
            1.0
        } else {
            ideal_weight as f64 / actual_weight as f64
        };

        let def = graph.definition(idx);
        DefinitionScore {
            definition_id: def.id,
            kind: def.kind,
            name: def.name.clone(),
            start_line: def.start_line,
            end_line: def.end_line,
            file_path: graph.file_path(file).to_string(),
            ideal_weight,
            actual_weight,
            cohesion_score,
            ideal_packages: ideal.into_keys().collect(),
            actual_packages: actual.into_keys().collect(),
        }
    }

    /// Score every definition; the aggregate is the mean over distinct
    /// definition ids, 1.0 for a graph without definitions.
    pub fn score<G: GraphSource + ?Sized>(&self, graph: &G) -> ScoreReport {
        let mut seen = HashSet::new();
        let definitions: Vec<DefinitionScore> = (0..graph.definition_count())
            .filter(|&idx| seen.insert(graph.definition(idx).id))
            .map(|idx| self.score_definition(graph, idx))
            .collect();

        let aggregate_score = if definitions.is_empty() {
            1.0
        } else {
            definitions.iter().map(|d| d.cohesion_score).sum::<f64>() / definitions.len() as f64
        };
        for d in &definitions {
            debug!(
                "{}:{} {} ideal={} actual={} score={:.4}",
                d.file_path, d.start_line, d.name, d.ideal_weight, d.actual_weight, d.cohesion_score
            );
        }
        info!(
            "Scored {} definitions, aggregate cohesion {:.4}",
            definitions.len(),
            aggregate_score
        );
        ScoreReport {
            definitions,
            aggregate_score,
        }
    }
}
