use kube::CustomResourceExt;
use kocao_types::{HarnessRun, WorkspaceSession};
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/kocao.withakay.github.com_workspacesessions.yaml",
        serde_yaml::to_string(&WorkspaceSession::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/kocao.withakay.github.com_harnessruns.yaml",
        serde_yaml::to_string(&HarnessRun::crd()).unwrap(),
    )
    .unwrap();
}
