//! Stand-in registry client.
//!
//! Understands the part of the skopeo command line the scenarios use and
//! talks to the fixtures over real registry HTTP. Login state lives in the
//! auth file named by `REGISTRY_AUTH_FILE`.

use registry_harness::credentials::AUTH_FILE_ENV;
use registry_harness::{CredentialStore, Credentials};
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::{json, Value};
use std::ffi::OsStr;
use std::fmt::Display;
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;

pub const NAME: &str = "skopeo";
const VERSION: &str = "1.16.1";
const OCI_MANIFEST_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
                               application/vnd.docker.distribution.manifest.v2+json";

type Outcome<T = String> = std::result::Result<T, String>;

fn text(e: impl Display) -> String {
    e.to_string()
}

/// Whether this process was started under the client's name.
pub fn invoked() -> bool {
    std::env::args_os()
        .next()
        .is_some_and(|arg0| Path::new(&arg0).file_stem() == Some(OsStr::new(NAME)))
}

pub fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let outcome = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(text)
        .and_then(|runtime| runtime.block_on(dispatch(&args)));

    let code = match outcome {
        Ok(output) => {
            print!("{}", output);
            ExitCode::SUCCESS
        }
        Err(message) => {
            eprintln!("Error: {}", message);
            ExitCode::FAILURE
        }
    };
    let _ = std::io::stdout().flush();
    code
}

async fn dispatch(args: &[String]) -> Outcome {
    let Some((command, rest)) = args.split_first() else {
        return Err("missing command".to_string());
    };
    match command.as_str() {
        "--version" => Ok(format!("{} version {}\n", NAME, VERSION)),
        "inspect" => inspect(Options::parse(rest, &["tls-verify", "creds", "cert-dir"])?).await,
        "login" => {
            login(Options::parse(rest, &["tls-verify", "username", "password", "get-login"])?).await
        }
        "logout" => logout(Options::parse(rest, &[])?),
        "copy" => copy(Options::parse(rest, &["src-tls-verify", "dest-tls-verify"])?).await,
        other => Err(format!("unknown command \"{}\" for \"{}\"", other, NAME)),
    }
}

struct Options {
    flags: Vec<(String, String)>,
    positional: Vec<String>,
}

impl Options {
    fn parse(args: &[String], known: &[&str]) -> Outcome<Self> {
        let mut flags = Vec::new();
        let mut positional = Vec::new();
        for arg in args {
            match arg.strip_prefix("--") {
                Some(flag) => {
                    let (name, value) = flag.split_once('=').unwrap_or((flag, "true"));
                    if !known.contains(&name) {
                        return Err(format!("unknown flag: --{}", name));
                    }
                    flags.push((name.to_string(), value.to_string()));
                }
                None => positional.push(arg.clone()),
            }
        }
        Ok(Self { flags, positional })
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.flags
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn single(&self) -> Outcome<&str> {
        match self.positional.as_slice() {
            [one] => Ok(one.as_str()),
            _ => Err("Exactly one argument expected".to_string()),
        }
    }
}

struct ImageRef {
    host: String,
    repo: String,
    tag: String,
}

fn parse_reference(reference: &str) -> Outcome<ImageRef> {
    let invalid = || {
        format!(
            "Invalid image name \"{}\", expected colon-separated transport:reference",
            reference
        )
    };
    let rest = reference.strip_prefix("docker://").ok_or_else(invalid)?;
    let (host, path) = rest.split_once('/').ok_or_else(invalid)?;
    let (repo, tag) = path.rsplit_once(':').unwrap_or((path, "latest"));
    Ok(ImageRef {
        host: host.to_string(),
        repo: repo.to_string(),
        tag: tag.to_string(),
    })
}

fn auth_store() -> Outcome<CredentialStore> {
    std::env::var_os(AUTH_FILE_ENV)
        .map(CredentialStore::at)
        .ok_or_else(|| format!("{} is not set", AUTH_FILE_ENV))
}

fn stored_credentials(host: &str) -> Outcome<Option<Credentials>> {
    match std::env::var_os(AUTH_FILE_ENV) {
        Some(path) => CredentialStore::at(path).get(host).map_err(text),
        None => Ok(None),
    }
}

struct Manifest {
    data: Vec<u8>,
    content_type: String,
    digest: String,
}

/// One registry, reached over https when it answers there and plain http otherwise.
struct Registry {
    client: Client,
    base: String,
    credentials: Option<Credentials>,
}

impl Registry {
    async fn connect(host: &str, credentials: Option<Credentials>) -> Outcome<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(text)?;
        for scheme in ["https", "http"] {
            let base = format!("{}://{}", scheme, host);
            if client.get(format!("{}/v2/", base)).send().await.is_ok() {
                return Ok(Self {
                    client,
                    base,
                    credentials,
                });
            }
        }
        Err(format!("pinging container registry {}: connection refused", host))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base, path));
        match &self.credentials {
            Some(c) => builder.basic_auth(&c.username, Some(&c.password)),
            None => builder,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Outcome<Response> {
        let response = request.send().await.map_err(text)?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(render_error(response).await)
        }
    }

    async fn manifest(&self, image: &ImageRef) -> Outcome<Manifest> {
        let path = format!("/v2/{}/manifests/{}", image.repo, image.tag);
        let response = self
            .send(self.request(Method::GET, &path).header(ACCEPT, MANIFEST_ACCEPT))
            .await?;
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(CONTENT_TYPE.as_str()).unwrap_or_else(|| OCI_MANIFEST_TYPE.to_string());
        let digest = header("docker-content-digest").unwrap_or_default();
        let data = response.bytes().await.map_err(text)?.to_vec();
        Ok(Manifest {
            data,
            content_type,
            digest,
        })
    }

    async fn blob(&self, repo: &str, digest: &str) -> Outcome<Vec<u8>> {
        let path = format!("/v2/{}/blobs/{}", repo, digest);
        let response = self.send(self.request(Method::GET, &path)).await?;
        Ok(response.bytes().await.map_err(text)?.to_vec())
    }

    async fn upload(&self, repo: &str, digest: &str, data: Vec<u8>) -> Outcome<()> {
        let path = format!("/v2/{}/blobs/uploads/", repo);
        let started = self.send(self.request(Method::POST, &path)).await?;
        let location = started
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| "upload started without a location".to_string())?
            .to_string();

        self.send(self.request(Method::PATCH, &location).body(data))
            .await?;
        self.send(self.request(Method::PUT, &format!("{}?digest={}", location, digest)))
            .await?;
        Ok(())
    }

    async fn put_manifest(&self, image: &ImageRef, manifest: &Manifest) -> Outcome<()> {
        let path = format!("/v2/{}/manifests/{}", image.repo, image.tag);
        self.send(
            self.request(Method::PUT, &path)
                .header(CONTENT_TYPE, manifest.content_type.as_str())
                .body(manifest.data.clone()),
        )
        .await?;
        Ok(())
    }
}

/// Renders a registry error envelope the way container tooling prints it,
/// e.g. `manifest unknown: manifest unknown`.
async fn render_error(response: Response) -> String {
    let status = response.status();
    let body = response.json::<Value>().await.unwrap_or_default();
    match body["errors"].get(0) {
        Some(error) => format!(
            "{}: {}",
            error["code"]
                .as_str()
                .unwrap_or_default()
                .to_lowercase()
                .replace('_', " "),
            error["message"].as_str().unwrap_or_default()
        ),
        None => format!("unexpected http status {}", status),
    }
}

async fn inspect(options: Options) -> Outcome {
    let reference = options.single()?;
    let image = parse_reference(reference)?;
    let credentials = match options.get("creds") {
        Some(creds) => {
            let (username, password) = creds
                .split_once(':')
                .ok_or_else(|| "credentials must be USERNAME:PASSWORD".to_string())?;
            Some(Credentials::new(username, password))
        }
        None => stored_credentials(&image.host)?,
    };

    let registry = Registry::connect(&image.host, credentials).await?;
    let manifest = registry.manifest(&image).await.map_err(|e| {
        format!(
            "reading manifest {} in {}/{}: {}",
            image.tag, image.host, image.repo, e
        )
    })?;

    let inspected = json!({
        "Name": format!("{}/{}", image.host, image.repo),
        "Tag": image.tag,
        "Digest": manifest.digest,
        "MediaType": manifest.content_type,
    });
    Ok(format!("{}\n", serde_json::to_string_pretty(&inspected).map_err(text)?))
}

async fn login(options: Options) -> Outcome {
    let host = options.single()?;
    let store = auth_store()?;

    if options.get("get-login").is_some() {
        return match store.get(host).map_err(text)? {
            Some(credentials) => Ok(format!("{}\n", credentials.username)),
            None => Err(format!("not logged into {}", host)),
        };
    }

    let (Some(username), Some(password)) = (options.get("username"), options.get("password"))
    else {
        return Err("both --username and --password are required".to_string());
    };
    let credentials = Credentials::new(username, password);
    let registry = Registry::connect(host, Some(credentials.clone())).await?;
    registry
        .send(registry.request(Method::GET, "/v2/"))
        .await
        .map_err(|e| format!("authenticating creds for {}: {}", host, e))?;

    store.set(host, &credentials).map_err(text)?;
    Ok("Login Succeeded!\n".to_string())
}

fn logout(options: Options) -> Outcome {
    let host = options.single()?;
    if auth_store()?.clear(host).map_err(text)? {
        Ok(format!("Removed login credentials for {}\n", host))
    } else {
        Err(format!("not logged into {}", host))
    }
}

async fn copy(options: Options) -> Outcome {
    let [source, destination] = options.positional.as_slice() else {
        return Err("Exactly two arguments expected".to_string());
    };
    let src = parse_reference(source)?;
    let dest = parse_reference(destination)?;

    let from = Registry::connect(&src.host, stored_credentials(&src.host)?).await?;
    let to = Registry::connect(&dest.host, stored_credentials(&dest.host)?).await?;

    let manifest = from
        .manifest(&src)
        .await
        .map_err(|e| format!("initializing source {}: {}", source, e))?;
    let parsed: Value = serde_json::from_slice(&manifest.data).map_err(text)?;
    let digests = std::iter::once(&parsed["config"])
        .chain(parsed["layers"].as_array().into_iter().flatten())
        .filter_map(|d| d["digest"].as_str())
        .map(str::to_string)
        .collect::<Vec<_>>();

    let mut output = String::from("Getting image source signatures\n");
    for digest in &digests {
        let data = from
            .blob(&src.repo, digest)
            .await
            .map_err(|e| format!("reading blob {}: {}", digest, e))?;
        to.upload(&dest.repo, digest, data)
            .await
            .map_err(|e| format!("writing blob: {}", e))?;
        output.push_str(&format!("Copying blob {}\n", digest));
    }

    to.put_manifest(&dest, &manifest)
        .await
        .map_err(|e| format!("writing manifest: {}", e))?;
    output.push_str("Writing manifest to image destination\n");
    Ok(output)
}
