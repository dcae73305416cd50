//! Print the Etcd CustomResourceDefinition as YAML

use etcd_druid::crd::Etcd;
use kube::CustomResourceExt;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", serde_yaml::to_string(&Etcd::crd())?);
    Ok(())
}
