//! Criterion benchmarks for cohesion-core.
//!
//! Only the pure-Rust internals are measured; nothing here starts a Python
//! interpreter.
//!
//! ## Benchmark groups
//!
//! 1. **schema**: DDL init + migration overhead.
//! 2. **scanner**: Import and definition extraction on synthetic modules.
//! 3. **scoring**: Cohesion scoring of synthetic graphs at several scales.
//! 4. **simulate**: Counterfactual moves followed by a rescore.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/cohesion-core/Cargo.toml -- scoring
//! ```

use std::fs;
use std::path::Path;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusqlite::Connection;

use _cohesion_core::config::WeightStrategy;
use _cohesion_core::graph::arena::DependencyGraph;
use _cohesion_core::graph::scoring::Scorer;
use _cohesion_core::indexer::scanner::{extract_import_statements, scan_source};
use _cohesion_core::models::{root_label, DefinitionKind, TransitiveImportRecord};
use _cohesion_core::store::schema::{migrate_schema, SCHEMA_STATEMENTS};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn setup_db() -> Connection {
    let mut conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
    for stmt in SCHEMA_STATEMENTS {
        conn.execute_batch(stmt).unwrap();
    }
    migrate_schema(&mut conn).unwrap();
    conn
}

/// A module with `n` functions, each using one of a handful of imports.
fn synthetic_module(n: usize) -> String {
    let packages = ["numpy", "yaml", "requests", "json", "os.path"];
    let mut source = String::new();
    for package in packages {
        source.push_str(&format!("import {package}\n"));
    }
    source.push_str("from collections import OrderedDict, defaultdict as dd\n\n");
    for i in 0..n {
        let package = packages[i % packages.len()];
        source.push_str(&format!(
            "def func_{i}(x):\n    \"\"\"Doc {i}.\"\"\"\n    y = {package}.thing(x)\n    return dd(list) if y else OrderedDict()\n\n"
        ));
        if i % 10 == 0 {
            source.push_str(&format!("class Holder{i}:\n    value = {i}\n\n"));
        }
    }
    source
}

/// Lay out `packages` fake installed packages of a few KiB each.
fn fake_site_packages(root: &Path, packages: usize) {
    for p in 0..packages {
        let dir = root.join(format!("pkg{p}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("__init__.py"), vec![b'#'; 1024 * (p + 1)]).unwrap();
    }
}

/// `files` files with `defs` definitions each; every file imports three
/// packages and each definition uses one of them.
fn synthetic_graph(root: &Path, files: usize, defs: usize, packages: usize) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for p in 0..packages {
        let code = format!("import pkg{p}");
        let module = format!("pkg{p}");
        let path = root.join(&module).join("__init__.py");
        graph.add_records(
            &code,
            vec![TransitiveImportRecord {
                root: root_label(&module),
                module,
                path: Some(path.to_string_lossy().into_owned()),
                version: None,
                code_str: code.clone(),
            }],
        );
    }
    for f in 0..files {
        let path = format!("/proj/mod_{f}.py");
        let codes: Vec<String> = (0..3)
            .map(|k| format!("import pkg{}", (f + k) % packages))
            .collect();
        for code in &codes {
            graph.add_file_import(&path, code);
        }
        for d in 0..defs {
            let idx = graph.add_definition(
                DefinitionKind::Function,
                &format!("func_{d}"),
                (d * 4 + 1) as i64,
                (d * 4 + 3) as i64,
                &path,
            );
            graph.add_definition_import(idx, &codes[d % codes.len()]);
        }
    }
    graph
}

// ---------------------------------------------------------------------------
// Benchmark: Schema
// ---------------------------------------------------------------------------

fn bench_schema_init(c: &mut Criterion) {
    c.bench_function("schema_init_and_migrate", |b| {
        b.iter(|| {
            let conn = setup_db();
            black_box(&conn);
        });
    });
}

fn bench_schema_migration_on_existing(c: &mut Criterion) {
    c.bench_function("schema_migration_noop_on_current", |b| {
        let mut conn = setup_db();
        b.iter(|| {
            migrate_schema(black_box(&mut conn)).unwrap();
        });
    });
}

// ---------------------------------------------------------------------------
// Benchmark: Scanner
// ---------------------------------------------------------------------------

fn bench_scanner(c: &mut Criterion) {
    let mut group = c.benchmark_group("scanner");

    for n in [10usize, 100, 500] {
        let source = synthetic_module(n);
        group.bench_with_input(BenchmarkId::new("scan_source", n), &source, |b, source| {
            b.iter(|| scan_source(black_box(source), "/proj/bench.py").unwrap());
        });
        group.bench_with_input(
            BenchmarkId::new("extract_import_statements", n),
            &source,
            |b, source| {
                b.iter(|| extract_import_statements(black_box(source), "/proj/bench.py").unwrap());
            },
        );
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: Scoring
// ---------------------------------------------------------------------------

fn bench_scoring(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    fake_site_packages(dir.path(), 8);
    let roots = vec![dir.path().to_path_buf()];
    let scorer = Scorer::for_roots(&roots, WeightStrategy::PackageDirectory, 1e-4);

    let mut group = c.benchmark_group("scoring");
    for (label, files, defs) in [("small", 10, 10), ("medium", 25, 20), ("large", 50, 40)] {
        let graph = synthetic_graph(dir.path(), files, defs, 8);
        group.bench_with_input(BenchmarkId::new("score", label), &graph, |b, graph| {
            b.iter(|| black_box(scorer.score(graph)));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: Counterfactual moves
// ---------------------------------------------------------------------------

fn bench_simulate(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    fake_site_packages(dir.path(), 8);
    let roots = vec![dir.path().to_path_buf()];
    let scorer = Scorer::for_roots(&roots, WeightStrategy::PackageDirectory, 1e-4);
    let graph = synthetic_graph(dir.path(), 25, 20, 8);

    let mut group = c.benchmark_group("simulate");

    group.bench_function("move_definition", |b| {
        b.iter(|| {
            graph
                .move_definition(DefinitionKind::Function, "/proj/mod_3.py", "func_7", "/proj/new.py")
                .unwrap()
        });
    });

    group.bench_function("move_definition_and_score", |b| {
        b.iter(|| {
            let view = graph
                .move_definition(DefinitionKind::Function, "/proj/mod_3.py", "func_7", "/proj/new.py")
                .unwrap();
            black_box(scorer.score(&view))
        });
    });

    group.bench_function("move_import_and_score", |b| {
        b.iter(|| {
            let view = graph
                .move_import("import pkg3", "/proj/mod_3.py", "/proj/mod_4.py")
                .unwrap();
            black_box(scorer.score(&view))
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Register all benchmark groups
// ---------------------------------------------------------------------------

criterion_group!(
    benches,
    bench_schema_init,
    bench_schema_migration_on_existing,
    bench_scanner,
    bench_scoring,
    bench_simulate,
);
criterion_main!(benches);
