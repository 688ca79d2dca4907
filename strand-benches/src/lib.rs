//! Benchmarks for the `strand` crate live under `benches/`.
