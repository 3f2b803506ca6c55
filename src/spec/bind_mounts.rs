//! Files the engine bind-mounts into every container
//!
//! resolv.conf, hosts, hostname, identity files, localtime, the
//! `.containerenv` marker, secrets and the notify socket directory. Every
//! producer writes into [`BindMounts`] of the container state; the mount
//! assembler turns the map into spec mounts.

use super::identity::{generate_passwd_and_group, HostAccounts, IdentityContext};
use super::mount::mount_exists;
use crate::config::EngineConfig;
use crate::container::runtime::Container;
use crate::container::store::ContainerLookup;
use crate::error::{EngineError, Result};
use crate::network::hosts::{self, HostEntry, HostsParams};
use crate::network::resolv::{self, ResolvParams};
use crate::network::status::{container_ips, first_gateway, has_ipv6};
use crate::util::{is_rootless, secure_join, write_file};
use oci_spec::runtime::Mount;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

pub const RESOLV_CONF: &str = "/etc/resolv.conf";
pub const HOSTS: &str = "/etc/hosts";
pub const HOSTNAME: &str = "/etc/hostname";
pub const PASSWD: &str = "/etc/passwd";
pub const GROUP: &str = "/etc/group";
pub const LOCALTIME: &str = "/etc/localtime";
pub const CONTAINERENV: &str = "/run/.containerenv";
pub const SECRETS_DIR: &str = "/run/secrets";
pub const NOTIFY_DIR: &str = "/run/notify";
/// Socket path handed to the container in `NOTIFY_SOCKET`
pub const NOTIFY_SOCKET: &str = "/run/notify/notify.sock";

/// Bind mounts replicated into every chroot directory
const CHROOT_REPLICATED: [&str; 4] = [RESOLV_CONF, HOSTS, HOSTNAME, CONTAINERENV];

/// Collaborators of the bind-mount producers
pub struct BindMountContext<'a> {
    pub engine: &'a EngineConfig,
    pub lookup: &'a dyn ContainerLookup,
    pub host: &'a dyn HostAccounts,
}

/// Follow the chain of network namespace owners to the container that
/// created the namespace
fn network_owner(lookup: &dyn ContainerLookup, container: &Container) -> Result<Option<Container>> {
    let first = match container.config.net_ns_container() {
        Some(id) => id.to_string(),
        None => return Ok(None),
    };
    let mut seen = vec![container.id().to_string()];
    let mut current = lookup.lookup(&first)?;
    loop {
        if seen.iter().any(|id| id == current.id()) {
            return Err(EngineError::config(
                container.id(),
                format!("network namespace dependency loop through container {}", current.id()),
            ));
        }
        seen.push(current.id().to_string());
        let next = current.config.net_ns_container().map(str::to_string);
        match next {
            Some(next) => current = lookup.lookup(&next)?,
            None => return Ok(Some(current)),
        }
    }
}

/// Use the resolv.conf and hosts file of the namespace owner
fn share_network_files(container: &mut Container, owner: &Container) -> Result<()> {
    for dest in [RESOLV_CONF, HOSTS] {
        if let Some(source) = owner.state.bind_mounts.get(dest) {
            container.state.bind_mounts.replace(dest, source);
        }
    }

    let hostname = container.hostname();
    if let Some(hosts_file) = owner.state.bind_mounts.get(HOSTS) {
        let content = std::fs::read_to_string(hosts_file)?;
        let known = content
            .lines()
            .any(|l| l.split_whitespace().skip(1).any(|n| n == hostname));
        if !known {
            let mut ips = container_ips(&owner.state.network_status);
            if ips.is_empty() {
                ips.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
            }
            let entries: Vec<HostEntry> = ips
                .into_iter()
                .map(|ip| HostEntry::new(ip, &[hostname.as_str()]))
                .collect();
            hosts::add_entries(hosts_file, &entries)?;
        }
    }
    Ok(())
}

fn resolv_params(engine: &EngineConfig, container: &Container) -> ResolvParams {
    let config = &container.config;
    let status = &container.state.network_status;

    let mut nameservers: Vec<String> = engine.dns_servers.clone();
    nameservers.extend(config.dns_servers.iter().map(|ip| ip.to_string()));
    let mut keep_host_servers = false;
    if nameservers.is_empty() {
        for block in status.values() {
            for server in &block.dns_server_ips {
                let server = server.to_string();
                if !nameservers.contains(&server) {
                    nameservers.push(server);
                }
            }
        }
        keep_host_servers = !nameservers.is_empty();
    }

    let mut custom_searches: Vec<String> = engine.dns_searches.clone();
    custom_searches.extend(config.dns_search.iter().cloned());
    let searches = if custom_searches.iter().any(|s| s == ".") {
        Some(Vec::new())
    } else if custom_searches.is_empty() {
        None
    } else {
        Some(custom_searches)
    };

    let mut options = engine.dns_options.clone();
    options.extend(config.dns_options.iter().cloned());

    ResolvParams {
        host_file: engine.host_etc_dir.join("resolv.conf"),
        nameservers,
        keep_host_servers,
        searches,
        network_searches: status
            .values()
            .flat_map(|b| b.dns_search_domains.iter().cloned())
            .collect(),
        options,
        ipv6_enabled: has_ipv6(status),
    }
}

fn make_resolv_conf(engine: &EngineConfig, container: &mut Container) -> Result<()> {
    let conf = resolv::generate(&resolv_params(engine, container))?;
    let path = write_file(container.run_dir(), "resolv.conf", &conf.render())?;
    container.state.bind_mounts.replace(RESOLV_CONF, path);
    Ok(())
}

fn make_hosts(engine: &EngineConfig, container: &mut Container, rootfs: &Path) -> Result<()> {
    let base = match engine.base_hosts_file.as_str() {
        "" => {
            let image_hosts = secure_join(rootfs, HOSTS)?;
            if image_hosts.is_file() {
                std::fs::read_to_string(image_hosts)?
            } else {
                String::new()
            }
        }
        "none" => String::new(),
        path => std::fs::read_to_string(path)?,
    };
    let status = &container.state.network_status;
    let params = HostsParams {
        base,
        extra: container.config.host_add.clone(),
        container_ips: container_ips(status),
        hostname: container.hostname(),
        name: container.name().to_string(),
        gateway: first_gateway(status),
    };
    let content = hosts::generate(&params)?;
    let path = write_file(container.run_dir(), "hosts", &content)?;
    container.state.bind_mounts.replace(HOSTS, path);
    Ok(())
}

fn make_localtime(engine: &EngineConfig, container: &mut Container) -> Result<()> {
    let timezone = match container.config.timezone.as_deref() {
        Some(tz) if !tz.is_empty() => tz.to_string(),
        _ => return Ok(()),
    };
    let source = if timezone == "local" {
        engine.host_etc_dir.join("localtime")
    } else {
        if Path::new(&timezone).is_absolute() || timezone.split('/').any(|c| c == "..") {
            return Err(EngineError::config(container.id(), format!("invalid timezone {}", timezone)));
        }
        engine.zoneinfo_dir.join(&timezone)
    };
    if !source.is_file() {
        return Err(EngineError::config(
            container.id(),
            format!("finding timezone {}: {} does not exist", timezone, source.display()),
        ));
    }
    let dest = container.run_dir().join("localtime");
    std::fs::create_dir_all(container.run_dir())?;
    std::fs::copy(&source, &dest)?;
    container.state.bind_mounts.replace(LOCALTIME, dest);
    Ok(())
}

fn make_containerenv(container: &mut Container) -> Result<()> {
    let content = if container.config.privileged {
        format!(
            "engine=\"rune-engine-{}\"\nname=\"{}\"\nid=\"{}\"\nimage=\"{}\"\nimageid=\"{}\"\nrootless={}\n",
            env!("CARGO_PKG_VERSION"),
            container.name(),
            container.id(),
            container.config.image,
            container.config.image_id,
            u8::from(is_rootless()),
        )
    } else {
        String::new()
    };
    let path = write_file(container.run_dir(), ".containerenv", &content)?;
    container.state.bind_mounts.replace(CONTAINERENV, path);
    Ok(())
}

fn make_secrets(engine: &EngineConfig, container: &mut Container) -> Result<()> {
    if container.config.secrets.is_empty() {
        return Ok(());
    }
    let secrets_dir = container.run_dir().join("secrets");
    std::fs::create_dir_all(&secrets_dir)?;
    for secret in container.config.secrets.clone() {
        let source = engine.secrets_dir.join(&secret.name);
        if !source.is_file() {
            return Err(EngineError::config(
                container.id(),
                format!("secret {} does not exist", secret.name),
            ));
        }
        let copy = secrets_dir.join(&secret.name);
        std::fs::copy(&source, &copy)?;

        let target = secret.target.clone().unwrap_or_else(|| secret.name.clone());
        let dest = if target.starts_with('/') {
            target
        } else {
            format!("{}/{}", SECRETS_DIR, target)
        };
        container.state.bind_mounts.replace(&dest, copy);
    }
    Ok(())
}

fn make_notify(engine: &EngineConfig, container: &mut Container) -> Result<()> {
    if !container.config.sd_notify_container || engine.notify_socket.is_none() {
        return Ok(());
    }
    let dir = container.bundle_path().join("notify");
    std::fs::create_dir_all(&dir)?;
    container.state.bind_mounts.replace(NOTIFY_DIR, dir);
    Ok(())
}

fn replicate_into_chroots(container: &mut Container) {
    for chroot in container.config.chroot_dirs.clone() {
        let chroot = chroot.trim_end_matches('/');
        for dest in CHROOT_REPLICATED {
            let source: Option<PathBuf> = container.state.bind_mounts.get(dest).map(Path::to_path_buf);
            if let Some(source) = source {
                let nested = format!("{}{}", chroot, dest);
                container.state.bind_mounts.insert_if_absent(&nested, source);
            }
        }
    }
}

/// Generate every engine-managed file and record it in the container's
/// bind-mount map. `mounts` are the user mounts of the spec; a destination
/// the user mounted is not generated.
pub fn make_bind_mounts(ctx: &BindMountContext<'_>, container: &mut Container, mounts: &[Mount]) -> Result<()> {
    let rootfs = container.mountpoint()?.to_path_buf();
    std::fs::create_dir_all(container.run_dir())?;

    if let Some(owner) = network_owner(ctx.lookup, container)? {
        tracing::debug!("Container {} shares network files of {}", container.id(), owner.id());
        share_network_files(container, &owner)?;
    } else {
        if !container.config.use_image_resolv_conf && !mount_exists(mounts, RESOLV_CONF) {
            make_resolv_conf(ctx.engine, container)?;
        }
        if !container.config.use_image_hosts && !mount_exists(mounts, HOSTS) {
            make_hosts(ctx.engine, container, &rootfs)?;
        }
    }

    if !container.state.bind_mounts.contains(HOSTNAME) && !mount_exists(mounts, HOSTNAME) {
        let path = write_file(container.run_dir(), "hostname", &format!("{}\n", container.hostname()))?;
        container.state.bind_mounts.insert_if_absent(HOSTNAME, path);
    }

    let generated = {
        let identity = IdentityContext {
            config: &container.config,
            rootfs: &rootfs,
            static_dir: container.bundle_path(),
            mounts,
        };
        generate_passwd_and_group(&identity, ctx.host)?
    };
    if let Some(passwd) = generated.passwd {
        container.state.bind_mounts.replace(PASSWD, passwd);
    }
    if let Some(group) = generated.group {
        container.state.bind_mounts.replace(GROUP, group);
    }

    make_localtime(ctx.engine, container)?;
    make_containerenv(container)?;
    make_secrets(ctx.engine, container)?;
    make_notify(ctx.engine, container)?;
    replicate_into_chroots(container);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::config::{ContainerConfig, NamespaceMode, SecretRef};
    use crate::container::state::ContainerState;
    use crate::network::status::{IpNet, NetAddress, NetInterface, StatusBlock};
    use crate::spec::identity::HostUser;
    use std::collections::HashMap;
    use tempfile::{tempdir, TempDir};

    struct NoHost;

    impl HostAccounts for NoHost {
        fn lookup_user(&self, name: &str) -> Result<HostUser> {
            Err(EngineError::Identity(format!("host user {} not found", name)))
        }

        fn current_user(&self) -> Result<Option<HostUser>> {
            Ok(None)
        }

        fn group_name(&self, _gid: u32) -> Option<String> {
            None
        }
    }

    struct Fixed(HashMap<String, Container>);

    impl ContainerLookup for Fixed {
        fn lookup(&self, id: &str) -> Result<Container> {
            self.0
                .get(id)
                .cloned()
                .ok_or_else(|| EngineError::ContainerNotFound(id.to_string()))
        }
    }

    struct Fixture {
        dir: TempDir,
        engine: EngineConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let etc = dir.path().join("hostetc");
            std::fs::create_dir_all(&etc).unwrap();
            std::fs::write(etc.join("resolv.conf"), "nameserver 10.0.0.2\nsearch corp\n").unwrap();
            std::fs::write(etc.join("localtime"), "TZif").unwrap();
            let mut engine = EngineConfig::with_roots(dir.path().join("root"), dir.path().join("run"));
            engine.host_etc_dir = etc;
            engine.zoneinfo_dir = dir.path().join("zoneinfo");
            Self { dir, engine }
        }

        fn container(&self, id: &str, config: ContainerConfig) -> Container {
            let mut config = config;
            config.id = id.to_string();
            let rootfs = self.dir.path().join("rootfs").join(id);
            std::fs::create_dir_all(rootfs.join("etc")).unwrap();
            std::fs::write(rootfs.join("etc/hosts"), "10.1.1.1\tcorp-gw\n").unwrap();
            let state = ContainerState {
                mounted: true,
                mountpoint: Some(rootfs),
                ..Default::default()
            };
            let ctr = Container::new(config, state, &self.engine.containers_dir(), &self.engine.run_root);
            ctr.create_dirs().unwrap();
            ctr
        }

        fn run(&self, lookup: &Fixed, ctr: &mut Container) -> Result<()> {
            let ctx = BindMountContext {
                engine: &self.engine,
                lookup,
                host: &NoHost,
            };
            make_bind_mounts(&ctx, ctr, &[])
        }
    }

    fn status() -> crate::network::status::NetworkStatus {
        let mut block = StatusBlock::default();
        block.interfaces.insert(
            "eth0".to_string(),
            NetInterface {
                mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
                subnets: vec![NetAddress {
                    ipnet: IpNet::new("10.88.0.5".parse().unwrap(), 16).unwrap(),
                    gateway: Some("10.88.0.1".parse().unwrap()),
                }],
            },
        );
        block.dns_server_ips = vec!["10.88.0.1".parse().unwrap()];
        block.dns_search_domains = vec!["dns.rune".to_string()];
        let mut status = crate::network::status::NetworkStatus::new();
        status.insert("rune".to_string(), block);
        status
    }

    #[test]
    fn test_standard_files() {
        let fx = Fixture::new();
        let mut ctr = fx.container("aaaaaaaaaaaaaaaa", ContainerConfig::new("web", "alpine"));
        ctr.state.network_status = status();
        fx.run(&Fixed(HashMap::new()), &mut ctr).unwrap();

        let resolv = std::fs::read_to_string(ctr.state.bind_mounts.get(RESOLV_CONF).unwrap()).unwrap();
        assert_eq!(resolv, "search dns.rune corp\nnameserver 10.88.0.1\nnameserver 10.0.0.2\n");

        let hosts = std::fs::read_to_string(ctr.state.bind_mounts.get(HOSTS).unwrap()).unwrap();
        assert!(hosts.starts_with("10.1.1.1\tcorp-gw\n"));
        assert!(hosts.contains("10.88.0.5\taaaaaaaaaaaa web\n"));
        assert!(hosts.contains("10.88.0.1\thost.containers.internal\n"));

        let hostname = std::fs::read_to_string(ctr.state.bind_mounts.get(HOSTNAME).unwrap()).unwrap();
        assert_eq!(hostname, "aaaaaaaaaaaa\n");

        let env = std::fs::read_to_string(ctr.state.bind_mounts.get(CONTAINERENV).unwrap()).unwrap();
        assert!(env.is_empty());
        assert!(!ctr.state.bind_mounts.contains(LOCALTIME));
    }

    #[test]
    fn test_user_mount_suppresses_generation() {
        let fx = Fixture::new();
        let mut ctr = fx.container("bbbbbbbbbbbbbbbb", ContainerConfig::new("web", "alpine"));
        let mounts = vec![oci_spec::runtime::MountBuilder::default()
            .destination(RESOLV_CONF)
            .source("/srv/resolv.conf")
            .typ("bind")
            .build()
            .unwrap()];
        let ctx = BindMountContext {
            engine: &fx.engine,
            lookup: &Fixed(HashMap::new()),
            host: &NoHost,
        };
        make_bind_mounts(&ctx, &mut ctr, &mounts).unwrap();
        assert!(!ctr.state.bind_mounts.contains(RESOLV_CONF));
        assert!(ctr.state.bind_mounts.contains(HOSTS));
    }

    #[test]
    fn test_shares_network_owner_files() {
        let fx = Fixture::new();
        let mut owner = fx.container("1111111111111111", ContainerConfig::new("db", "alpine"));
        owner.state.network_status = status();
        fx.run(&Fixed(HashMap::new()), &mut owner).unwrap();

        let mut config = ContainerConfig::new("sidecar", "alpine");
        config.namespaces.net = NamespaceMode::FromContainer(owner.id().to_string());
        config.hostname = "sidecar".to_string();
        let mut ctr = fx.container("2222222222222222", config);
        let lookup = Fixed(HashMap::from([(owner.id().to_string(), owner.clone())]));
        fx.run(&lookup, &mut ctr).unwrap();

        assert_eq!(
            ctr.state.bind_mounts.get(HOSTS),
            owner.state.bind_mounts.get(HOSTS)
        );
        assert_eq!(
            ctr.state.bind_mounts.get(RESOLV_CONF),
            owner.state.bind_mounts.get(RESOLV_CONF)
        );
        let hosts = std::fs::read_to_string(owner.state.bind_mounts.get(HOSTS).unwrap()).unwrap();
        assert!(hosts.contains("10.88.0.5\tsidecar\n"));
    }

    #[test]
    fn test_network_dependency_loop() {
        let fx = Fixture::new();
        let mut a_config = ContainerConfig::new("a", "alpine");
        a_config.namespaces.net = NamespaceMode::FromContainer("bbbb".to_string());
        let a = fx.container("aaaa", a_config);
        let mut b_config = ContainerConfig::new("b", "alpine");
        b_config.namespaces.net = NamespaceMode::FromContainer("aaaa".to_string());
        let mut b = fx.container("bbbb", b_config);
        let lookup = Fixed(HashMap::from([
            ("aaaa".to_string(), a),
            ("bbbb".to_string(), b.clone()),
        ]));
        let err = fx.run(&lookup, &mut b).unwrap_err();
        assert!(err.to_string().contains("dependency loop"));
    }

    #[test]
    fn test_localtime_secrets_and_chroots() {
        let fx = Fixture::new();
        std::fs::create_dir_all(&fx.engine.secrets_dir).unwrap();
        std::fs::write(fx.engine.secrets_dir.join("token"), "s3cret").unwrap();

        let mut config = ContainerConfig::new("web", "alpine");
        config.timezone = Some("local".to_string());
        config.privileged = true;
        config.secrets = vec![
            SecretRef { name: "token".to_string(), target: None },
            SecretRef { name: "token".to_string(), target: Some("/etc/app/token".to_string()) },
        ];
        config.chroot_dirs = vec!["/var/chroot/".to_string()];
        let mut ctr = fx.container("cccccccccccccccc", config);
        fx.run(&Fixed(HashMap::new()), &mut ctr).unwrap();

        let mounts = &ctr.state.bind_mounts;
        assert_eq!(std::fs::read_to_string(mounts.get(LOCALTIME).unwrap()).unwrap(), "TZif");
        assert!(mounts.contains("/run/secrets/token"));
        assert!(mounts.contains("/etc/app/token"));
        assert_eq!(mounts.get("/var/chroot/etc/hosts"), mounts.get(HOSTS));
        assert!(mounts.contains("/var/chroot/run/.containerenv"));

        let env = std::fs::read_to_string(mounts.get(CONTAINERENV).unwrap()).unwrap();
        assert!(env.contains("name=\"web\""));
        assert!(env.contains("id=\"cccccccccccccccc\""));
    }

    #[test]
    fn test_missing_secret_and_timezone() {
        let fx = Fixture::new();
        let mut config = ContainerConfig::new("web", "alpine");
        config.secrets = vec![SecretRef { name: "absent".to_string(), target: None }];
        let mut ctr = fx.container("dddddddddddddddd", config);
        assert!(fx.run(&Fixed(HashMap::new()), &mut ctr).is_err());

        let mut config = ContainerConfig::new("web", "alpine");
        config.timezone = Some("../../etc/shadow".to_string());
        let mut ctr = fx.container("eeeeeeeeeeeeeeee", config);
        let err = fx.run(&Fixed(HashMap::new()), &mut ctr).unwrap_err();
        assert!(err.to_string().contains("invalid timezone"));
    }
}
