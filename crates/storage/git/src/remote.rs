use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    io_err, read_table, unique_suffix, with_file_lock, write_table, GitStoreError, Table,
};

#[cfg(feature = "remote-git")]
#[derive(Clone, Copy, Debug)]
pub enum CredentialMode {
    Helper,
    UserPass,
    Token,
    SshAgent,
}

#[cfg(feature = "remote-git")]
#[derive(Clone)]
pub(crate) struct CredentialConfig {
    mode: CredentialMode,
    username: Option<String>,
    secret_env: Option<String>,
    // resolved once when credentials are configured
    cached_secret: Option<String>,
}

#[cfg(feature = "remote-git")]
impl CredentialConfig {
    pub(crate) fn new(
        mode: CredentialMode,
        username: Option<String>,
        secret_env: Option<String>,
    ) -> Self {
        let cached_secret = secret_env.as_deref().and_then(|k| std::env::var(k).ok());
        if cached_secret.is_none() && secret_env.is_some() {
            tracing::warn!(
                env_var = ?secret_env,
                "credential secret environment variable not found or empty"
            );
        }
        Self {
            mode,
            username,
            secret_env,
            cached_secret,
        }
    }

    fn secret(&self) -> Option<String> {
        self.cached_secret
            .clone()
            .or_else(|| self.secret_env.as_deref().and_then(|k| std::env::var(k).ok()))
    }
}

/// Where a database is published. One directory (file remote) or one branch
/// (git remote) per database.
pub(crate) enum Remote {
    Dir(PathBuf),
    #[cfg(feature = "remote-git")]
    Git {
        url: String,
        repo_dir: PathBuf,
        cred: Option<CredentialConfig>,
    },
}

impl Remote {
    pub(crate) fn parse(host: &str, root: &Path) -> Result<Self, GitStoreError> {
        if let Some(path) = host.strip_prefix("file://") {
            return Ok(Remote::Dir(PathBuf::from(path)));
        }
        #[cfg(feature = "remote-git")]
        {
            Ok(Remote::Git {
                url: host.to_owned(),
                repo_dir: root.join(".remote-git"),
                cred: None,
            })
        }
        #[cfg(not(feature = "remote-git"))]
        {
            let _ = root;
            Err(GitStoreError::Unsupported(format!(
                "{host}: git remotes need feature remote-git"
            )))
        }
    }

    #[cfg(feature = "remote-git")]
    pub(crate) fn set_credentials(&mut self, cred: Option<CredentialConfig>) {
        if let Remote::Git { cred: slot, .. } = self {
            *slot = cred;
        }
    }

    /// Run `f` as one step against the remote copy of `database`. Directory
    /// remotes are guarded by `<remote>/<database>.LOCK`, so concurrent
    /// processes cannot interleave a fetch and a publish. Git remotes rely on
    /// non-forced pushes instead.
    pub(crate) fn locked<T>(
        &self,
        database: &str,
        f: impl FnOnce() -> Result<T, GitStoreError>,
    ) -> Result<T, GitStoreError> {
        match self {
            Remote::Dir(base) => {
                fs::create_dir_all(base).map_err(io_err)?;
                with_file_lock(&base.join(format!("{database}.LOCK")), f)
            }
            #[cfg(feature = "remote-git")]
            Remote::Git { .. } => f(),
        }
    }

    pub(crate) fn fetch(&self, database: &str) -> Result<Table, GitStoreError> {
        match self {
            Remote::Dir(base) => read_table(&base.join(database)),
            #[cfg(feature = "remote-git")]
            Remote::Git {
                url,
                repo_dir,
                cred,
            } => git::fetch(repo_dir, url, cred.as_ref(), database),
        }
    }

    /// Replace the remote copy of `database` with `table`. For git remotes the
    /// new commit's parent is the tip seen by the last fetch, so a concurrent
    /// publisher makes the push fail instead of being overwritten.
    pub(crate) fn publish(&self, database: &str, table: &Table) -> Result<(), GitStoreError> {
        match self {
            Remote::Dir(base) => publish_dir(base, database, table),
            #[cfg(feature = "remote-git")]
            Remote::Git {
                url,
                repo_dir,
                cred,
            } => git::publish(repo_dir, url, cred.as_ref(), database, table),
        }
    }

    pub(crate) fn wipe(&self, database: &str) -> Result<(), GitStoreError> {
        match self {
            Remote::Dir(base) => {
                let dir = base.join(database);
                if dir.exists() {
                    fs::remove_dir_all(&dir).map_err(|e| {
                        GitStoreError::Io(format!("remove_dir_all {}: {}", dir.display(), e))
                    })?;
                }
                Ok(())
            }
            #[cfg(feature = "remote-git")]
            Remote::Git { .. } => {
                self.fetch(database)?;
                self.publish(database, &Table::new())
            }
        }
    }
}

/// Write `table` to a staging directory, then swap it in with renames so a
/// reader sees either the old table or the new one.
fn publish_dir(base: &Path, database: &str, table: &Table) -> Result<(), GitStoreError> {
    let suffix = unique_suffix();
    let staging = base.join(format!(".{database}.staging-{suffix}"));
    let retired = base.join(format!(".{database}.old-{suffix}"));
    let target = base.join(database);
    write_table(&staging, table)?;
    let rename = |from: &Path, to: &Path| {
        fs::rename(from, to).map_err(|e| {
            GitStoreError::Io(format!("rename {} -> {}: {}", from.display(), to.display(), e))
        })
    };
    if target.exists() {
        rename(&target, &retired)?;
    }
    rename(&staging, &target)?;
    if retired.exists() {
        fs::remove_dir_all(&retired).map_err(io_err)?;
    }
    Ok(())
}

#[cfg(feature = "remote-git")]
mod git {
    use std::path::Path;

    use git2::{Cred, ErrorCode, FetchOptions, Oid, PushOptions, RemoteCallbacks, Repository};

    use super::{CredentialConfig, CredentialMode};
    use crate::{decode_entry, encode_entry, key_file_name, GitStoreError, Table};

    fn git_err(e: git2::Error) -> GitStoreError {
        GitStoreError::Git(e.to_string())
    }

    fn branch_name(database: &str) -> String {
        format!("memsync/{database}")
    }

    fn tracking_ref(database: &str) -> String {
        format!("refs/remotes/sync/{}", branch_name(database))
    }

    fn open_repo(dir: &Path) -> Result<Repository, GitStoreError> {
        match Repository::open_bare(dir) {
            Ok(r) => Ok(r),
            Err(_) => Repository::init_bare(dir).map_err(git_err),
        }
    }

    fn tracking_tip(repo: &Repository, database: &str) -> Result<Option<Oid>, GitStoreError> {
        match repo.refname_to_id(&tracking_ref(database)) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(git_err(e)),
        }
    }

    fn callbacks<'a>(cred: Option<&'a CredentialConfig>) -> RemoteCallbacks<'a> {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |url, username_from_url, _allowed_types| {
            let helper = || match git2::Config::open_default() {
                Ok(cfg) => Cred::credential_helper(&cfg, url, username_from_url),
                Err(_) => Cred::default(),
            };
            let Some(c) = cred else {
                return helper();
            };
            let user = c
                .username
                .clone()
                .or_else(|| username_from_url.map(|s| s.to_string()));
            match c.mode {
                CredentialMode::Helper => helper(),
                CredentialMode::UserPass => match c.secret() {
                    Some(pass) => {
                        Cred::userpass_plaintext(&user.unwrap_or_else(|| "git".into()), &pass)
                    }
                    None => Cred::default(),
                },
                CredentialMode::Token => {
                    let user = c
                        .username
                        .clone()
                        .unwrap_or_else(|| "x-access-token".into());
                    Cred::userpass_plaintext(&user, &c.secret().unwrap_or_default())
                }
                CredentialMode::SshAgent => {
                    Cred::ssh_key_from_agent(&user.unwrap_or_else(|| "git".into()))
                }
            }
        });
        callbacks
    }

    pub(super) fn fetch(
        repo_dir: &Path,
        url: &str,
        cred: Option<&CredentialConfig>,
        database: &str,
    ) -> Result<Table, GitStoreError> {
        let repo = open_repo(repo_dir)?;
        let refspec = format!(
            "+refs/heads/{}:{}",
            branch_name(database),
            tracking_ref(database)
        );
        let mut remote = repo.remote_anonymous(url).map_err(git_err)?;
        let mut opts = FetchOptions::new();
        opts.remote_callbacks(callbacks(cred));
        remote
            .fetch(&[refspec.as_str()], Some(&mut opts), None)
            .map_err(git_err)?;

        let mut table = Table::new();
        let Some(oid) = tracking_tip(&repo, database)? else {
            // nothing published upstream yet
            return Ok(table);
        };
        let tree = repo
            .find_commit(oid)
            .and_then(|c| c.tree())
            .map_err(git_err)?;
        for entry in tree.iter() {
            let blob = repo.find_blob(entry.id()).map_err(git_err)?;
            let Some((key, value)) = decode_entry(blob.content()) else {
                tracing::warn!(entry = ?entry.name(), "skipping unreadable tree entry");
                continue;
            };
            table.insert(key, value);
        }
        Ok(table)
    }

    pub(super) fn publish(
        repo_dir: &Path,
        url: &str,
        cred: Option<&CredentialConfig>,
        database: &str,
        table: &Table,
    ) -> Result<(), GitStoreError> {
        let repo = open_repo(repo_dir)?;
        let parent = match tracking_tip(&repo, database)? {
            Some(oid) => Some(repo.find_commit(oid).map_err(git_err)?),
            None => None,
        };
        let mut builder = repo.treebuilder(None).map_err(git_err)?;
        for (key, data) in table {
            let blob = repo.blob(&encode_entry(key, data)?).map_err(git_err)?;
            builder
                .insert(key_file_name(key), blob, 0o100644)
                .map_err(git_err)?;
        }
        let tree_oid = builder.write().map_err(git_err)?;
        let tree = repo.find_tree(tree_oid).map_err(git_err)?;
        let sig = git2::Signature::now("memsync", "memsync@localhost").map_err(git_err)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let message = format!("chore(memsync): sync {database}");
        let commit = repo
            .commit(None, &sig, &sig, &message, &tree, &parents)
            .map_err(git_err)?;

        let local_ref = format!("refs/heads/{}", branch_name(database));
        repo.reference(&local_ref, commit, true, "memsync publish")
            .map_err(git_err)?;

        let mut rejection: Option<String> = None;
        {
            let mut remote = repo.remote_anonymous(url).map_err(git_err)?;
            let mut cbs = callbacks(cred);
            cbs.push_update_reference(|refname, status| {
                if let Some(msg) = status {
                    rejection = Some(format!("{refname}: {msg}"));
                }
                Ok(())
            });
            let mut opts = PushOptions::new();
            opts.remote_callbacks(cbs);
            let spec = format!("{local_ref}:{local_ref}");
            remote
                .push(&[spec.as_str()], Some(&mut opts))
                .map_err(git_err)?;
        }
        if let Some(reason) = rejection {
            return Err(GitStoreError::Git(format!("push rejected: {reason}")));
        }
        repo.reference(&tracking_ref(database), commit, true, "memsync published")
            .map_err(git_err)?;
        Ok(())
    }
}
