use dash0_operator_apis::{Dash0Monitoring, Dash0OperatorConfiguration};
use kube::CustomResourceExt;
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&Dash0Monitoring::crd()).unwrap());
    println!("---");
    println!(
        "{}",
        serde_yaml::to_string(&Dash0OperatorConfiguration::crd()).unwrap()
    );
}
