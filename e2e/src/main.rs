#![allow(unused_imports)]
#![allow(unused_variables)]
pub mod common;
pub mod workload_e2e;

use common::Error;
use std::env;
use workload_e2e::{workload_e2e_test, workload_protocol_e2e_test};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args: Vec<String> = env::args().collect();
    let cmd = args.get(1).cloned().unwrap_or_default();
    match cmd.as_str() {
        "workload" => {
            println!("Running workload end-to-end test");
            workload_e2e_test().await
        }
        "protocol" => {
            println!("Running mount protocol end-to-end test");
            workload_protocol_e2e_test().await
        }
        _ => {
            println!("Please specify one test: workload | protocol");
            Ok(())
        }
    }
}
