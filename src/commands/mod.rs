pub mod generate_data;
pub mod market_data_snapshot;
pub mod plan;
pub mod run;
pub mod worker;
