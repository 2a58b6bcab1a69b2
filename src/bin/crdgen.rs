use cidr_allocator::crd::NodeCIDRAllocation;
use kube::CustomResourceExt;

fn main() {
    match serde_yaml::to_string(&NodeCIDRAllocation::crd()) {
        Ok(crd) => print!("{crd}"),
        Err(e) => {
            eprintln!("unable to serialize NodeCIDRAllocation CRD: {e}");
            std::process::exit(1);
        }
    }
}
