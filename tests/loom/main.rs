#![cfg(loom)]

mod segment;
