//! End-to-end tests driven through the spawned compaction loops.
