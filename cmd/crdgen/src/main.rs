use kube::CustomResourceExt;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&stackop_stack::crd::PRStack::crd())
            .expect("CRD serializes to YAML")
    );
}
