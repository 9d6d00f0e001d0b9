// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router server
//!
//! The router owns the default file type locally and forwards every other
//! type to the storage node the route table names. Each client connection is
//! served on its own task.

use shardfs_core::{
    ClusterConfig, Limits, NamespaceTranslator, RouteTable, ShardError, ShardResult,
};
use shardfs_store::{archiver_for, Archiver, NamespaceRoot, StoreClient};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::dispatch::Session;

/// Immutable state shared by every session
pub struct RouterContext {
    pub routes: RouteTable,
    pub translator: NamespaceTranslator,
    pub local: NamespaceRoot,
    /// One client per storage node, in route-table order
    pub stores: Vec<StoreClient>,
    pub archiver: Arc<dyn Archiver>,
    pub limits: Limits,
}

impl RouterContext {
    pub fn new(config: &ClusterConfig) -> ShardResult<Self> {
        let routes = config.route_table()?;
        let translator = config.translator()?;
        let local = NamespaceRoot::new(routes.local(), translator.clone());
        let stores = routes
            .remotes()
            .iter()
            .map(|node| StoreClient::new(node, &config.limits))
            .collect();
        Ok(Self {
            routes,
            translator,
            local,
            stores,
            archiver: archiver_for(config.archiver),
            limits: config.limits.clone(),
        })
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn client_for(&self, node: &str) -> ShardResult<&StoreClient> {
        self.stores
            .iter()
            .find(|c| c.node().name == node)
            .ok_or_else(|| ShardError::Configuration(format!("no client for node {}", node)))
    }
}

pub struct Router {
    context: Arc<RouterContext>,
    listener: TcpListener,
}

impl Router {
    pub async fn bind(context: RouterContext, addr: &str) -> ShardResult<Self> {
        context.local.ensure_root().await?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ShardError::Configuration(format!("cannot bind {}: {}", addr, e)))?;
        Ok(Self {
            context: Arc::new(context),
            listener,
        })
    }

    pub async fn from_config(config: &ClusterConfig) -> ShardResult<Self> {
        Self::bind(RouterContext::new(config)?, &config.router.address()).await
    }

    pub fn context(&self) -> &Arc<RouterContext> {
        &self.context
    }

    pub fn local_addr(&self) -> ShardResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> ShardResult<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Accept clients until `shutdown` completes. Sessions already running
    /// are left to finish on their own.
    pub async fn serve_until<F>(self, shutdown: F) -> ShardResult<()>
    where
        F: Future<Output = ()>,
    {
        let local = self.context.routes.local();
        tracing::info!(
            node = %local.name,
            addr = %self.local_addr()?,
            extension = %local.extension,
            root = %self.context.local.root().display(),
            "Router listening"
        );
        for node in self.context.routes.remotes() {
            tracing::info!(node = %node.name, extension = %node.extension, addr = %node.address(), "Route");
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let session = Session::new(self.context.clone(), stream, peer);
                        tokio::spawn(session.run());
                    }
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
            }
        }
        tracing::info!("Router stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RouterClient;
    use shardfs_core::{Ack, Operation, Reason};
    use shardfs_store::{StorageNode, TarArchiver};
    use std::collections::HashMap;
    use std::path::Path;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    struct Cluster {
        home: tempfile::TempDir,
        config: ClusterConfig,
        router_addr: String,
        nodes: HashMap<String, (oneshot::Sender<()>, JoinHandle<ShardResult<()>>)>,
    }

    impl Cluster {
        async fn start(limits: Limits) -> Self {
            let home = tempfile::tempdir().unwrap();
            let mut config = ClusterConfig {
                home: Some(home.path().to_path_buf()),
                limits,
                ..Default::default()
            };
            let translator = config.translator().unwrap();

            let mut nodes = HashMap::new();
            for store in config.stores.iter_mut() {
                store.port = 0;
                let node = StorageNode::bind(
                    store.clone(),
                    translator.clone(),
                    Arc::new(TarArchiver),
                    config.limits.clone(),
                )
                .await
                .unwrap();
                store.port = node.local_addr().unwrap().port();
                let (stop, stopped) = oneshot::channel::<()>();
                let task = tokio::spawn(node.serve_until(async {
                    let _ = stopped.await;
                }));
                nodes.insert(store.name.clone(), (stop, task));
            }

            config.router.port = 0;
            let router = Router::from_config(&config).await.unwrap();
            let router_addr = router.local_addr().unwrap().to_string();
            tokio::spawn(router.serve());

            Self { home, config, router_addr, nodes }
        }

        async fn client(&self) -> RouterClient {
            RouterClient::connect(&self.router_addr, &self.config.limits)
                .await
                .unwrap()
        }

        async fn stop_node(&mut self, name: &str) {
            let (stop, task) = self.nodes.remove(name).unwrap();
            stop.send(()).unwrap();
            task.await.unwrap().unwrap();
        }

        fn path(&self, rel: &str) -> std::path::PathBuf {
            self.home.path().join(rel)
        }
    }

    fn archive_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(bytes);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_round_trip_every_type() {
        let cluster = Cluster::start(Limits::default()).await;
        let mut client = cluster.client().await;

        for (name, body) in [
            ("main.c", b"int main(void) { return 0; }\n".to_vec()),
            ("paper.pdf", vec![0x25; 70_000]),
            ("notes.txt", b"milk\neggs\n".to_vec()),
            ("bundle.zip", (0..200_000u32).map(|i| i as u8).collect()),
        ] {
            let ack = client.upload_bytes(name, "~s1/round", &body).await.unwrap();
            assert_eq!(ack, Ack::Success(Operation::Upload), "upload {}", name);

            let (ack, got) = client.download_bytes(&format!("~s1/round/{}", name)).await.unwrap();
            assert_eq!(ack, Ack::Success(Operation::Download), "download {}", name);
            assert_eq!(got, body, "content of {}", name);
        }

        assert!(cluster.path("s1/round/main.c").is_file());
        assert!(cluster.path("s2/round/paper.pdf").is_file());
        assert!(cluster.path("s3/round/notes.txt").is_file());
        assert!(cluster.path("s4/round/bundle.zip").is_file());
        assert!(!cluster.path("s1/round/paper.pdf").exists());

        assert_eq!(client.exit().await.unwrap(), Ack::Goodbye);
    }

    #[tokio::test]
    async fn test_remove_then_not_found() {
        let cluster = Cluster::start(Limits::default()).await;
        let mut client = cluster.client().await;

        for name in ["gone.c", "gone.pdf", "gone.txt", "gone.zip"] {
            client.upload_bytes(name, "~s1", b"x").await.unwrap();
            assert_eq!(
                client.remove(&format!("~s1/{}", name)).await.unwrap(),
                Ack::Success(Operation::Remove)
            );
            let (ack, body) = client.download_bytes(name).await.unwrap();
            assert_eq!(ack, Ack::failed(Operation::Download, Reason::FileNotFound));
            assert!(body.is_empty());
            assert_eq!(
                client.remove(name).await.unwrap(),
                Ack::failed(Operation::Remove, Reason::FileNotFound)
            );
        }
    }

    #[tokio::test]
    async fn test_list_order_is_fixed() {
        let cluster = Cluster::start(Limits::default()).await;
        let mut client = cluster.client().await;

        let (ack, names) = client.list(".").await.unwrap();
        assert_eq!(ack, Ack::Success(Operation::List));
        assert!(names.is_empty());

        for name in ["c.zip", "a.pdf", "d.c", "b.txt"] {
            client.upload_bytes(name, "~s1", b"data").await.unwrap();
        }
        let (_, names) = client.list("~s1").await.unwrap();
        assert_eq!(names, vec!["d.c", "a.pdf", "b.txt", "c.zip"]);
    }

    #[tokio::test]
    async fn test_list_subtree() {
        let cluster = Cluster::start(Limits::default()).await;
        let mut client = cluster.client().await;
        client.upload_bytes("in.pdf", "~s1/reports", b"1").await.unwrap();
        client.upload_bytes("out.pdf", "~s1/other", b"2").await.unwrap();
        client.upload_bytes("in.c", "~s1/reports", b"3").await.unwrap();

        let (_, names) = client.list("~s1/reports").await.unwrap();
        assert_eq!(names, vec!["reports/in.c", "reports/in.pdf"]);
    }

    #[tokio::test]
    async fn test_local_archive_contains_exactly_c_files() {
        let cluster = Cluster::start(Limits::default()).await;
        let mut client = cluster.client().await;
        client.upload_bytes("x.c", "~s1", b"int x;").await.unwrap();
        client.upload_bytes("y.c", "~s1/src", b"int y;").await.unwrap();
        client.upload_bytes("z.pdf", "~s1/src", b"%PDF").await.unwrap();
        std::fs::write(cluster.path("s1/src/readme.md"), b"stray").unwrap();

        let mut bytes = Vec::new();
        let (ack, _) = client.archive_into(".c", &mut bytes).await.unwrap();
        assert_eq!(ack, Ack::Archive("cfiles.tar".into()));
        assert_eq!(archive_names(&bytes), vec!["src/y.c", "x.c"]);
    }

    #[tokio::test]
    async fn test_remote_archive_is_relayed() {
        let cluster = Cluster::start(Limits::default()).await;
        let mut client = cluster.client().await;
        client.upload_bytes("b.txt", "~s1/notes", b"b").await.unwrap();
        client.upload_bytes("a.txt", "~s1", b"a").await.unwrap();

        let mut bytes = Vec::new();
        let (ack, _) = client.archive_into("txt", &mut bytes).await.unwrap();
        assert_eq!(ack, Ack::Archive("txtfiles.tar".into()));
        assert_eq!(archive_names(&bytes), vec!["a.txt", "notes/b.txt"]);

        let dir = tempfile::tempdir().unwrap();
        let (ack, n) = client.archive_to(".txt", dir.path(), None).await.unwrap();
        assert!(ack.is_success());
        assert_eq!(std::fs::metadata(dir.path().join("txtfiles.tar")).unwrap().len(), n);
    }

    #[tokio::test]
    async fn test_pdf_upload_lands_on_pdf_node() {
        let cluster = Cluster::start(Limits::default()).await;
        let mut client = cluster.client().await;

        let body = vec![0xABu8; 4096];
        let ack = client.upload_bytes("report.pdf", "~s1/reports", &body).await.unwrap();
        assert_eq!(ack.to_string(), "UPLOAD_SUCCESS");

        assert!(cluster.path("s2/reports").is_dir());
        assert_eq!(std::fs::read(cluster.path("s2/reports/report.pdf")).unwrap(), body);
        assert!(!cluster.path("s1/reports/report.pdf").exists());
    }

    #[tokio::test]
    async fn test_missing_txt_has_no_payload() {
        let cluster = Cluster::start(Limits::default()).await;
        let mut client = cluster.client().await;

        let (ack, body) = client.download_bytes("notes.txt").await.unwrap();
        assert_eq!(ack.to_string(), "DOWNLOAD_FAILED:FILE_NOT_FOUND");
        assert!(body.is_empty());

        // The next command is answered normally.
        let (ack, _) = client.list(".").await.unwrap();
        assert_eq!(ack, Ack::Success(Operation::List));
    }

    #[tokio::test]
    async fn test_concurrent_pdf_uploads() {
        let cluster = Cluster::start(Limits::default()).await;
        let mut first = cluster.client().await;
        let mut second = cluster.client().await;

        let one = vec![1u8; 300_000];
        let two = vec![2u8; 300_000];
        let (a, b) = tokio::join!(
            first.upload_bytes("one.pdf", "~s1/shared", &one),
            second.upload_bytes("two.pdf", "~s1/shared", &two),
        );
        assert_eq!(a.unwrap(), Ack::Success(Operation::Upload));
        assert_eq!(b.unwrap(), Ack::Success(Operation::Upload));

        assert_eq!(first.download_bytes("~s1/shared/two.pdf").await.unwrap().1, two);
        assert_eq!(second.download_bytes("~s1/shared/one.pdf").await.unwrap().1, one);
    }

    #[tokio::test]
    async fn test_stopped_node() {
        let mut cluster = Cluster::start(Limits::default()).await;
        let mut client = cluster.client().await;
        client.upload_bytes("keep.txt", "~s1", b"t").await.unwrap();
        client.upload_bytes("keep.c", "~s1", b"c").await.unwrap();

        cluster.stop_node("s2").await;

        let ack = client.upload_bytes("lost.pdf", "~s1", b"%PDF").await.unwrap();
        assert_eq!(ack.to_string(), "UPLOAD_FAILED:BACKEND_UNAVAILABLE");
        assert!(!cluster.path("s1/lost.pdf").exists());
        assert!(!cluster.path("s2/lost.pdf").exists());

        let (ack, _) = client.download_bytes("lost.pdf").await.unwrap();
        assert_eq!(ack, Ack::failed(Operation::Download, Reason::BackendUnavailable));

        let (ack, names) = client.list(".").await.unwrap();
        assert_eq!(ack, Ack::Success(Operation::List));
        assert_eq!(names, vec!["keep.c", "keep.txt"]);

        let (ack, _) = client.archive_into(".pdf", &mut Vec::<u8>::new()).await.unwrap();
        assert_eq!(ack, Ack::failed(Operation::Tar, Reason::BackendUnavailable));
    }

    #[tokio::test]
    async fn test_oversize_payload_keeps_connection() {
        let limits = Limits {
            max_payload_bytes: 1000,
            chunk_size: 256,
            ..Default::default()
        };
        let cluster = Cluster::start(limits).await;
        let mut client = cluster.client().await;

        for name in ["big.c", "big.pdf"] {
            let ack = client.upload_bytes(name, "~s1", &[7u8; 5000]).await.unwrap();
            assert_eq!(ack, Ack::failed(Operation::Upload, Reason::PayloadTooLarge));
        }
        assert!(!cluster.path("s1/big.c").exists());
        assert!(!cluster.path("s2/big.pdf").exists());

        let ack = client.upload_bytes("small.pdf", "~s1", &[7u8; 500]).await.unwrap();
        assert_eq!(ack, Ack::Success(Operation::Upload));
    }

    #[tokio::test]
    async fn test_escapes_rejected() {
        let cluster = Cluster::start(Limits::default()).await;
        let mut client = cluster.client().await;

        let ack = client.upload_bytes("a.pdf", "~s1/../../etc", b"x").await.unwrap();
        assert_eq!(ack, Ack::failed(Operation::Upload, Reason::InvalidPath));
        let ack = client.upload_bytes("a.c", "../outside", b"x").await.unwrap();
        assert_eq!(ack, Ack::failed(Operation::Upload, Reason::InvalidPath));

        let (ack, _) = client.download_bytes("~s1/../s2/x.txt").await.unwrap();
        assert_eq!(ack, Ack::failed(Operation::Download, Reason::InvalidPath));
        assert_eq!(
            client.remove("/etc/passwd.txt").await.unwrap(),
            Ack::failed(Operation::Remove, Reason::InvalidPath)
        );
    }

    #[tokio::test]
    async fn test_raw_protocol_errors() {
        let cluster = Cluster::start(Limits::default()).await;
        let mut client = cluster.client().await;
        let conn = client.connection();

        conn.write_line("listall").await.unwrap();
        assert_eq!(conn.recv_ack().await.unwrap(), Ack::InvalidCommand);

        conn.write_line("uploadf photo.jpg ~s1").await.unwrap();
        conn.send_bytes(b"\xFF\xD8", &shardfs_core::TransferBuffer::new(16)).await.unwrap();
        assert_eq!(
            conn.recv_ack().await.unwrap(),
            Ack::failed(Operation::Upload, Reason::InvalidFileType)
        );

        conn.write_line("downlf README").await.unwrap();
        assert_eq!(
            conn.recv_ack().await.unwrap(),
            Ack::failed(Operation::Download, Reason::NoExtension)
        );

        conn.write_line("exit").await.unwrap();
        assert_eq!(conn.recv_ack().await.unwrap(), Ack::Goodbye);
        assert_eq!(conn.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_upload_from_disk() {
        let cluster = Cluster::start(Limits::default()).await;
        let mut client = cluster.client().await;
        let scratch = tempfile::tempdir().unwrap();
        let source = scratch.path().join("draft.txt");
        std::fs::write(&source, b"draft").unwrap();

        assert!(client.upload(&source, "~s1/drafts").await.unwrap().is_success());
        let output = scratch.path().join("copy.txt");
        let (ack, n) = client.download_to("~s1/drafts/draft.txt", Path::new(&output)).await.unwrap();
        assert!(ack.is_success());
        assert_eq!(n, 5);
        assert_eq!(std::fs::read(&output).unwrap(), b"draft");

        let missing = scratch.path().join("missing.txt");
        let (ack, _) = client.download_to("~s1/none.txt", &missing).await.unwrap();
        assert!(!ack.is_success());
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn test_peers_with_different_chunk_sizes() {
        let limits = Limits {
            chunk_size: 300,
            ..Default::default()
        };
        let cluster = Cluster::start(limits).await;

        let small = Limits {
            chunk_size: 1024,
            ..Default::default()
        };
        let large = Limits::default();
        let mut narrow = RouterClient::connect(&cluster.router_addr, &small).await.unwrap();
        let mut wide = RouterClient::connect(&cluster.router_addr, &large).await.unwrap();

        let body: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        for name in ["wide.c", "wide.pdf"] {
            let ack = wide.upload_bytes(name, "~s1/mixed", &body).await.unwrap();
            assert_eq!(ack, Ack::Success(Operation::Upload), "upload {}", name);

            let (ack, got) = narrow.download_bytes(&format!("~s1/mixed/{}", name)).await.unwrap();
            assert_eq!(ack, Ack::Success(Operation::Download), "download {}", name);
            assert_eq!(got, body, "content of {}", name);
        }

        let c_file = vec![b'c'; 10_000];
        narrow.upload_bytes("ten.c", "~s1", &c_file).await.unwrap();
        let (_, got) = wide.download_bytes("ten.c").await.unwrap();
        assert_eq!(got, c_file);
    }

    #[tokio::test]
    async fn test_listing_over_limit_is_reported() {
        let limits = Limits {
            max_listing_bytes: 64,
            ..Default::default()
        };
        let cluster = Cluster::start(limits).await;
        let mut client = cluster.client().await;

        client.upload_bytes("a.c", "~s1", b"int a;").await.unwrap();
        client.upload_bytes("b.pdf", "~s1", b"%PDF").await.unwrap();
        let (ack, names) = client.list(".").await.unwrap();
        assert_eq!(ack, Ack::Success(Operation::List));
        assert_eq!(names, vec!["a.c", "b.pdf"]);

        for i in 0..10 {
            let name = format!("quarterly-report-{:02}.pdf", i);
            client.upload_bytes(&name, "~s1", b"%PDF").await.unwrap();
        }
        assert_eq!(std::fs::read_dir(cluster.path("s2")).unwrap().count(), 11);
        assert!(client.list(".").await.is_err());

        // The aborted listing leaves the session usable.
        assert_eq!(client.exit().await.unwrap(), Ack::Goodbye);
    }
}
