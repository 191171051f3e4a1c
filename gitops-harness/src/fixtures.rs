//! Manifest fixtures.
//!
//! YAML templates are embedded in the binary and rendered with simple
//! `{{key}}` substitution, so tests never depend on working-directory
//! layout. Rendered manifests are written into the test's workdir.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Demo workload pushed into each test's config repo. Two containers so
/// tests can observe per-container image state independently.
const DEMO_WORKLOAD_TPL: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: demo
  namespace: {{namespace}}
  annotations:
    fluxcd.io/automated: "{{automated}}"
spec:
  replicas: 1
  selector:
    matchLabels:
      app: demo
  template:
    metadata:
      labels:
        app: demo
    spec:
      containers:
      - name: demo
        image: quay.io/weaveworks/helloworld:{{image_tag}}
        ports:
        - containerPort: 80
      - name: sidecar
        image: quay.io/weaveworks/sidecar:{{sidecar_tag}}
---
apiVersion: v1
kind: Service
metadata:
  name: demo
  namespace: {{namespace}}
spec:
  type: NodePort
  selector:
    app: demo
  ports:
  - port: 80
    nodePort: {{node_port}}
"#;

/// Controller deployment applied during setup when tests deploy the
/// controller from a manifest rather than a chart. Mounts the deploy key
/// secret and the known-hosts configmap, and exposes the read API on a
/// node port.
const CONTROLLER_DEPLOY_TPL: &str = r#"apiVersion: v1
kind: ServiceAccount
metadata:
  name: gitops-controller
  namespace: {{namespace}}
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: gitops-controller
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: cluster-admin
subjects:
- kind: ServiceAccount
  name: gitops-controller
  namespace: {{namespace}}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: flux
  namespace: {{namespace}}
spec:
  replicas: 1
  selector:
    matchLabels:
      name: flux
  template:
    metadata:
      labels:
        name: flux
    spec:
      serviceAccountName: gitops-controller
      volumes:
      - name: git-key
        secret:
          secretName: flux-git-deploy
      - name: ssh-known-hosts
        configMap:
          name: ssh-known-hosts
      containers:
      - name: flux
        image: {{image}}
        imagePullPolicy: IfNotPresent
        args:
        - --git-url={{git_url}}
        - --git-branch=master
        volumeMounts:
        - name: git-key
          mountPath: /etc/fluxd/ssh
        - name: ssh-known-hosts
          mountPath: /root/.ssh
---
apiVersion: v1
kind: Service
metadata:
  name: flux
  namespace: {{namespace}}
spec:
  type: NodePort
  selector:
    name: flux
  ports:
  - port: 3030
    nodePort: {{api_port}}
"#;

/// Render a template by replacing every `{{key}}` with its value. Keys with
/// no placeholder are ignored; placeholders with no key are left in place so
/// a mismatch is visible in the output.
fn render(template: &str, values: &BTreeMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// Render the demo workload manifest for `namespace` with the given image
/// tags, returning the YAML text. `automated` opts the workload into the
/// controller's image automation.
pub fn demo_workload(
    namespace: &str,
    image_tag: &str,
    sidecar_tag: &str,
    node_port: u16,
    automated: bool,
) -> String {
    let mut values = BTreeMap::new();
    values.insert("namespace", namespace.to_string());
    values.insert("image_tag", image_tag.to_string());
    values.insert("sidecar_tag", sidecar_tag.to_string());
    values.insert("node_port", node_port.to_string());
    values.insert("automated", automated.to_string());
    render(DEMO_WORKLOAD_TPL, &values)
}

/// Render the controller deployment manifest, returning the YAML text.
pub fn controller_deployment(namespace: &str, image: &str, git_url: &str, api_port: u16) -> String {
    let mut values = BTreeMap::new();
    values.insert("namespace", namespace.to_string());
    values.insert("image", image.to_string());
    values.insert("git_url", git_url.to_string());
    values.insert("api_port", api_port.to_string());
    render(CONTROLLER_DEPLOY_TPL, &values)
}

/// Write rendered YAML under `dir` and return the file's path.
pub fn write_manifest(dir: &Path, file_name: &str, content: &str) -> io::Result<PathBuf> {
    let path = dir.join(file_name);
    fs::write(&path, content)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_workload_substitutes_all_placeholders() {
        let yaml = demo_workload("default", "master-a000001", "master-a000001", 30500, true);
        assert!(yaml.contains("image: quay.io/weaveworks/helloworld:master-a000001"));
        assert!(yaml.contains("image: quay.io/weaveworks/sidecar:master-a000001"));
        assert!(yaml.contains("namespace: default"));
        assert!(yaml.contains("nodePort: 30500"));
        assert!(yaml.contains(r#"fluxcd.io/automated: "true""#));
        assert!(!yaml.contains("{{"), "unrendered placeholder in:\n{yaml}");
    }

    #[test]
    fn test_controller_deployment_substitutes_all_placeholders() {
        let yaml = controller_deployment(
            "gitops",
            "quay.io/weaveworks/flux:latest",
            "ssh://docker@192.168.49.2/home/docker/gitops.git",
            30080,
        );
        assert!(yaml.contains("image: quay.io/weaveworks/flux:latest"));
        assert!(yaml.contains("--git-url=ssh://docker@192.168.49.2/home/docker/gitops.git"));
        assert!(yaml.contains("nodePort: 30080"));
        assert!(!yaml.contains("{{"), "unrendered placeholder in:\n{yaml}");
    }

    #[test]
    fn test_unknown_placeholder_survives_render() {
        let mut values = BTreeMap::new();
        values.insert("known", "x".to_string());
        let out = render("{{known}} {{unknown}}", &values);
        assert_eq!(out, "x {{unknown}}");
    }

    #[test]
    fn test_write_manifest_creates_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_manifest(tmp.path(), "demo.yaml", "kind: Deployment\n").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "kind: Deployment\n");
    }
}
