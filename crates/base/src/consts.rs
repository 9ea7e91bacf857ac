pub mod k8s {
    pub mod labels {
        /// Label key shared by every cluster object a tunnel creates. The
        /// label value is the tunnel name, so `kubetnl cleanup` can find
        /// leftovers from a crashed run by selector.
        pub const TUNNEL: &str = "io.github.kubetnl";
    }
}

/// Default image for the in-pod SSH daemon. The image must honour the
/// `PORT`, `PASSWORD_ACCESS`, `USER_NAME` and `USER_PASSWORD` environment
/// variables and run init scripts mounted under `/custom-cont-init.d`.
pub const DEFAULT_IMAGE: &str = "docker.io/linuxserver/openssh-server:latest";

/// Fixed credentials configured on the SSH daemon. The daemon is only
/// reachable through the cluster-authenticated port-forward, never as a
/// public endpoint; this is an accepted risk, not an oversight.
pub const SSH_USER: &str = "user";
pub const SSH_PASSWORD: &str = "password";
