mod helpers;
mod merge_tests;
mod store_tests;
