pub mod helpers;

mod tests_compaction;
mod tests_iterator;
mod tests_merge_operator;
mod tests_range_delete;
mod tests_single_delete;
mod tests_stall_shutdown;
