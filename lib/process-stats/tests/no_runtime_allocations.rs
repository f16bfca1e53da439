//! Allocation test for `Querier`.
//!
//! Note: this is an integration test as the global allocator must be overridden to track all allocations made, and
//! doing so in normal unit tests could interfere with other tests.

use dhat::{HeapStats, Profiler};
use process_stats::Querier;

#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

#[test]
fn no_runtime_allocations() {
    // The `/cpu` and `/memory` endpoints may be polled at a high rate by a benchmark harness, so querying must not
    // perturb the memory footprint being measured.
    let mut querier = Querier::default();

    let _profiler = Profiler::builder().testing().build();
    let _cpu = querier.cpu_percent();
    let _vms = querier.virtual_memory_size();
    let _rss = querier.resident_set_size();
    let _vms = querier.virtual_memory_size();
    let stats = HeapStats::get();

    dhat::assert_eq!(stats.total_blocks, 0);
    dhat::assert_eq!(stats.total_bytes, 0);
    dhat::assert_eq!(stats.curr_blocks, 0);
    dhat::assert_eq!(stats.curr_bytes, 0);
}
