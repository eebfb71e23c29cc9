//! The container runtime's driver boundary: a JSON-over-HTTP activation
//! protocol on a Unix socket. This layer only parses requests, delegates
//! to the network manager, and encodes responses; every reply is HTTP 200
//! with an `Err` field that is empty on success.

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::driver::NetworkManager;
use crate::error::Result;

const IO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize, Default)]
struct IpamData {
	#[serde(default, rename = "Pool")]
	pool: String,
	#[serde(default, rename = "Gateway")]
	gateway: String,
}

#[derive(Deserialize)]
struct CreateNetworkRequest {
	#[serde(rename = "NetworkID")]
	network_id: String,
	#[serde(default, rename = "Options")]
	options: serde_json::Map<String, Value>,
	#[serde(default, rename = "IPv4Data")]
	ipv4_data: Vec<IpamData>,
}

#[derive(Deserialize)]
struct NetworkRequest {
	#[serde(rename = "NetworkID")]
	network_id: String,
}

#[derive(Deserialize, Default)]
struct EndpointInterface {
	#[serde(default, rename = "Address")]
	address: String,
	#[serde(default, rename = "MacAddress")]
	mac_address: String,
}

#[derive(Deserialize)]
struct CreateEndpointRequest {
	#[serde(rename = "NetworkID")]
	network_id: String,
	#[serde(rename = "EndpointID")]
	endpoint_id: String,
	#[serde(default, rename = "Interface")]
	interface: EndpointInterface,
	#[serde(default, rename = "Options")]
	options: serde_json::Map<String, Value>,
}

#[derive(Deserialize)]
struct EndpointRequest {
	#[serde(rename = "NetworkID")]
	network_id: String,
	#[serde(rename = "EndpointID")]
	endpoint_id: String,
}

#[derive(Deserialize)]
struct JoinRequest {
	#[serde(rename = "NetworkID")]
	network_id: String,
	#[serde(rename = "EndpointID")]
	endpoint_id: String,
	#[serde(default, rename = "SandboxKey")]
	sandbox_key: String,
	#[serde(default, rename = "Options")]
	options: serde_json::Map<String, Value>,
}

fn err_response(message: impl std::fmt::Display) -> Value {
	json!({ "Err": message.to_string() })
}

fn ok_response() -> Value {
	json!({ "Err": "" })
}

/// The runtime announces exposed ports as `{Proto, Port}` pairs; fold
/// them into the `"<port>/<proto>"` map the discovery sources use.
fn translate_exposed_ports(options: &mut serde_json::Map<String, Value>) {
	let Some(Value::Array(entries)) =
		options.get("com.docker.network.endpoint.exposedports")
	else {
		return;
	};
	let mut exposed = match options.get("ExposedPorts") {
		Some(Value::Object(map)) => map.clone(),
		_ => serde_json::Map::new(),
	};
	for entry in entries {
		let port = entry.get("Port").and_then(Value::as_u64);
		let proto = match entry.get("Proto").and_then(Value::as_u64) {
			Some(17) => "udp",
			_ => "tcp",
		};
		if let Some(port) = port {
			exposed.insert(format!("{port}/{proto}"), json!({}));
		}
	}
	if !exposed.is_empty() {
		options.insert("ExposedPorts".to_string(), Value::Object(exposed));
	}
}

fn parse_requested_address(interface: &EndpointInterface) -> Option<Ipv4Addr> {
	let raw = interface.address.split('/').next()?;
	raw.parse().ok()
}

pub fn dispatch(path: &str, body: &[u8], manager: &NetworkManager) -> Value {
	macro_rules! parse {
		($ty:ty) => {
			match serde_json::from_slice::<$ty>(body) {
				Ok(req) => req,
				Err(e) => return err_response(format!("bad request: {e}")),
			}
		};
	}

	match path {
		"/Plugin.Activate" => json!({ "Implements": ["NetworkDriver"] }),
		"/NetworkDriver.GetCapabilities" => json!({
			"Scope": "local",
			"ConnectivityScope": "local",
			"Err": ""
		}),
		"/NetworkDriver.CreateNetwork" => {
			let req = parse!(CreateNetworkRequest);
			let ipam = req.ipv4_data.first();
			let pool = ipam.map(|d| d.pool.as_str()).filter(|p| !p.is_empty());
			let gateway = ipam
				.map(|d| d.gateway.as_str())
				.filter(|g| !g.is_empty());
			match manager.create_network(&req.network_id, &req.options, pool, gateway) {
				Ok(()) => ok_response(),
				Err(e) => err_response(e),
			}
		}
		"/NetworkDriver.DeleteNetwork" => {
			let req = parse!(NetworkRequest);
			match manager.delete_network(&req.network_id) {
				Ok(()) => ok_response(),
				Err(e) => err_response(e),
			}
		}
		"/NetworkDriver.CreateEndpoint" => {
			let req = parse!(CreateEndpointRequest);
			let requested = parse_requested_address(&req.interface);
			let mut options = req.options;
			translate_exposed_ports(&mut options);
			match manager.create_endpoint(
				&req.network_id,
				&req.endpoint_id,
				requested,
				options,
			) {
				Ok((address, prefix, mac)) => {
					// fields the runtime supplied must not be echoed back
					let mut interface = serde_json::Map::new();
					if requested.is_none() {
						interface.insert(
							"Address".to_string(),
							Value::String(format!("{address}/{prefix}")),
						);
					}
					if req.interface.mac_address.is_empty() {
						interface.insert("MacAddress".to_string(), Value::String(mac));
					}
					json!({ "Interface": interface, "Err": "" })
				}
				Err(e) => err_response(e),
			}
		}
		"/NetworkDriver.DeleteEndpoint" => {
			let req = parse!(EndpointRequest);
			match manager.delete_endpoint(&req.network_id, &req.endpoint_id) {
				Ok(()) => ok_response(),
				Err(e) => err_response(e),
			}
		}
		"/NetworkDriver.EndpointOperInfo" => {
			let req = parse!(EndpointRequest);
			match manager.endpoint_info(&req.network_id, &req.endpoint_id) {
				Ok(value) => json!({ "Value": value, "Err": "" }),
				Err(e) => err_response(e),
			}
		}
		"/NetworkDriver.Join" => {
			let req = parse!(JoinRequest);
			match manager.join(
				&req.network_id,
				&req.endpoint_id,
				&req.sandbox_key,
				&req.options,
			) {
				Ok(gateway) => {
					let short: String = req.endpoint_id.chars().take(7).collect();
					json!({
						"InterfaceName": {
							"SrcName": format!("i2p{short}"),
							"DstPrefix": "eth"
						},
						"Gateway": gateway.to_string(),
						"Err": ""
					})
				}
				Err(e) => err_response(e),
			}
		}
		"/NetworkDriver.Leave" => {
			let req = parse!(EndpointRequest);
			match manager.leave(&req.network_id, &req.endpoint_id) {
				Ok(()) => ok_response(),
				Err(e) => err_response(e),
			}
		}
		"/NetworkDriver.DiscoverNew"
		| "/NetworkDriver.DiscoverDelete"
		| "/NetworkDriver.ProgramExternalConnectivity"
		| "/NetworkDriver.RevokeExternalConnectivity" => ok_response(),
		other => err_response(format!("unknown path {other}")),
	}
}

pub struct RpcServer {
	listener: UnixListener,
	manager: Arc<NetworkManager>,
}

impl RpcServer {
	/// Binds the plugin socket, replacing any stale file, and restricts
	/// it to the owning user.
	pub fn bind(path: &str, manager: Arc<NetworkManager>) -> Result<RpcServer> {
		let socket_path = Path::new(path);
		if let Some(parent) = socket_path.parent() {
			fs::create_dir_all(parent)?;
		}
		if socket_path.exists() {
			fs::remove_file(socket_path)?;
		}
		let listener = UnixListener::bind(socket_path)?;
		fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))?;
		info!("driver listening on {path}");
		Ok(RpcServer { listener, manager })
	}

	/// Accept loop; each connection is served on its own thread.
	pub fn serve(&self) -> Result<()> {
		for stream in self.listener.incoming() {
			match stream {
				Ok(stream) => {
					let manager = self.manager.clone();
					thread::spawn(move || {
						if let Err(e) = handle_connection(stream, &manager) {
							debug!("rpc connection: {e}");
						}
					});
				}
				Err(e) => {
					warn!("rpc accept failed: {e}");
				}
			}
		}
		Ok(())
	}
}

fn handle_connection(stream: UnixStream, manager: &NetworkManager) -> std::io::Result<()> {
	stream.set_read_timeout(Some(IO_TIMEOUT))?;
	stream.set_write_timeout(Some(IO_TIMEOUT))?;
	let mut reader = BufReader::new(stream.try_clone()?);
	let mut stream = stream;

	let mut request_line = String::new();
	if reader.read_line(&mut request_line)? == 0 {
		return Ok(());
	}
	let mut parts = request_line.split_whitespace();
	let _method = parts.next().unwrap_or("");
	let path = parts.next().unwrap_or("").to_string();

	let mut content_length = 0usize;
	loop {
		let mut header = String::new();
		if reader.read_line(&mut header)? == 0 {
			break;
		}
		let header = header.trim_end();
		if header.is_empty() {
			break;
		}
		if let Some((name, value)) = header.split_once(':') {
			if name.eq_ignore_ascii_case("content-length") {
				content_length = value.trim().parse().unwrap_or(0);
			}
		}
	}

	let mut body = vec![0u8; content_length];
	if content_length > 0 {
		reader.read_exact(&mut body)?;
	}

	debug!("rpc {path}");
	let response = dispatch(&path, &body, manager);
	let payload = response.to_string();
	let http = format!(
		"HTTP/1.1 200 OK\r\nContent-Type: application/vnd.docker.plugins.v1.1+json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
		payload.len()
	);
	stream.write_all(http.as_bytes())?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;
	use std::process;

	fn manager() -> Arc<NetworkManager> {
		Arc::new(NetworkManager::new(Config::default()))
	}

	fn call(manager: &NetworkManager, path: &str, body: Value) -> Value {
		dispatch(path, body.to_string().as_bytes(), manager)
	}

	fn assert_ok(value: &Value) {
		assert_eq!(value.get("Err").and_then(Value::as_str), Some(""), "{value}");
	}

	#[test]
	fn activation_and_capabilities() {
		let m = manager();
		let activate = call(&m, "/Plugin.Activate", json!({}));
		assert_eq!(activate["Implements"], json!(["NetworkDriver"]));

		let caps = call(&m, "/NetworkDriver.GetCapabilities", json!({}));
		assert_eq!(caps["Scope"], "local");
		assert_eq!(caps["ConnectivityScope"], "local");
	}

	#[test]
	fn malformed_bodies_are_reported_in_err() {
		let m = manager();
		let resp = dispatch("/NetworkDriver.CreateNetwork", b"{not json", &m);
		let err = resp["Err"].as_str().unwrap();
		assert!(err.starts_with("bad request"));
	}

	#[test]
	fn unknown_paths_are_reported_in_err() {
		let m = manager();
		let resp = call(&m, "/NetworkDriver.Bogus", json!({}));
		assert!(!resp["Err"].as_str().unwrap().is_empty());
	}

	#[test]
	fn endpoint_lifecycle_over_rpc() {
		let m = manager();
		let create = call(
			&m,
			"/NetworkDriver.CreateNetwork",
			json!({
				"NetworkID": "n1",
				"Options": {
					"com.docker.network.generic": {"i2p.transparent": "false"}
				},
				"IPv4Data": [{"Pool": "192.168.201.0/24", "Gateway": "192.168.201.1/24"}]
			}),
		);
		assert_ok(&create);

		let endpoint = call(
			&m,
			"/NetworkDriver.CreateEndpoint",
			json!({"NetworkID": "n1", "EndpointID": "e1", "Interface": {}}),
		);
		assert_ok(&endpoint);
		let address = endpoint["Interface"]["Address"].as_str().unwrap();
		assert_eq!(address, "192.168.201.2/24");
		let mac = endpoint["Interface"]["MacAddress"].as_str().unwrap();
		assert!(mac.starts_with("02:42:"));

		let join = call(
			&m,
			"/NetworkDriver.Join",
			json!({
				"NetworkID": "n1",
				"EndpointID": "e1",
				"SandboxKey": "/var/run/docker/netns/abc123"
			}),
		);
		assert_ok(&join);
		assert_eq!(join["Gateway"], "192.168.201.1");

		let info = call(
			&m,
			"/NetworkDriver.EndpointOperInfo",
			json!({"NetworkID": "n1", "EndpointID": "e1"}),
		);
		assert_ok(&info);
		assert_eq!(info["Value"]["Address"], "192.168.201.2");

		assert_ok(&call(
			&m,
			"/NetworkDriver.Leave",
			json!({"NetworkID": "n1", "EndpointID": "e1"}),
		));
		assert_ok(&call(
			&m,
			"/NetworkDriver.DeleteEndpoint",
			json!({"NetworkID": "n1", "EndpointID": "e1"}),
		));
		assert_ok(&call(
			&m,
			"/NetworkDriver.DeleteNetwork",
			json!({"NetworkID": "n1"}),
		));
	}

	#[test]
	fn supplied_interface_fields_are_not_echoed() {
		let m = manager();
		assert_ok(&call(
			&m,
			"/NetworkDriver.CreateNetwork",
			json!({
				"NetworkID": "n2",
				"Options": {
					"com.docker.network.generic": {"i2p.transparent": "false"}
				},
				"IPv4Data": [{"Pool": "192.168.202.0/24", "Gateway": "192.168.202.1/24"}]
			}),
		));
		let endpoint = call(
			&m,
			"/NetworkDriver.CreateEndpoint",
			json!({
				"NetworkID": "n2",
				"EndpointID": "e1",
				"Interface": {"Address": "192.168.202.33/24"}
			}),
		);
		assert_ok(&endpoint);
		assert!(endpoint["Interface"].get("Address").is_none());
	}

	#[test]
	fn exposed_port_translation() {
		let mut options = json!({
			"com.docker.network.endpoint.exposedports": [
				{"Proto": 6, "Port": 80},
				{"Proto": 17, "Port": 53}
			]
		})
		.as_object()
		.unwrap()
		.clone();
		translate_exposed_ports(&mut options);
		let exposed = options["ExposedPorts"].as_object().unwrap();
		assert!(exposed.contains_key("80/tcp"));
		assert!(exposed.contains_key("53/udp"));
	}

	#[test]
	fn http_round_trip_over_unix_socket() {
		let m = manager();
		let socket_path = std::env::temp_dir().join(format!(
			"i2pnetd-test-{}-{:?}.sock",
			process::id(),
			std::thread::current().id()
		));
		let socket_path = socket_path.to_str().unwrap().to_string();
		let server = RpcServer::bind(&socket_path, m).unwrap();
		thread::spawn(move || {
			let _ = server.serve();
		});

		let mut stream = UnixStream::connect(&socket_path).unwrap();
		stream
			.set_read_timeout(Some(Duration::from_secs(5)))
			.unwrap();
		let body = "{}";
		let request = format!(
			"POST /Plugin.Activate HTTP/1.1\r\nHost: plugin\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
			body.len()
		);
		stream.write_all(request.as_bytes()).unwrap();

		let mut response = String::new();
		stream.read_to_string(&mut response).unwrap();
		assert!(response.starts_with("HTTP/1.1 200 OK"));
		assert!(response.contains("NetworkDriver"));

		// 0600 on the socket file
		let mode = fs::metadata(&socket_path).unwrap().permissions().mode();
		assert_eq!(mode & 0o777, 0o600);
		let _ = fs::remove_file(&socket_path);
	}
}
