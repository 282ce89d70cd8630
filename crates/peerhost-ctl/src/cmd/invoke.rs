//! Invoke a function through the gateway, the way a browser would.

use anyhow::{Context, Result, bail};

use super::http::base_url;

#[derive(Debug, PartialEq)]
pub struct InvokeArgs {
    pub owner: String,
    pub project: String,
    pub function: String,
    pub method: String,
    pub body: Option<serde_json::Value>,
    pub query: Vec<(String, String)>,
}

/// `<owner> <project> <function> [--method M] [--body JSON] [--query k=v]...`
pub fn parse_args(args: &[&str]) -> Result<InvokeArgs> {
    let [owner, project, function, rest @ ..] = args else {
        bail!("invoke requires <owner> <project> <function>");
    };

    let mut parsed = InvokeArgs {
        owner: owner.to_string(),
        project: project.to_string(),
        function: function.to_string(),
        method: "GET".to_string(),
        body: None,
        query: Vec::new(),
    };

    let mut i = 0;
    while i < rest.len() {
        let flag = rest[i];
        i += 1;
        let value = *rest.get(i).with_context(|| format!("{} requires a value", flag))?;
        match flag {
            "--method" => parsed.method = value.to_ascii_uppercase(),
            "--body" => {
                parsed.body = Some(serde_json::from_str(value).context("--body must be valid JSON")?)
            }
            "--query" => {
                let (k, v) = value.split_once('=').context("--query takes key=value")?;
                parsed.query.push((k.to_string(), v.to_string()));
            }
            other => bail!("unknown invoke option {}", other),
        }
        i += 1;
    }

    Ok(parsed)
}

pub async fn cmd_invoke(port: u16, args: &[&str]) -> Result<()> {
    let args = parse_args(args)?;
    let url = reqwest::Url::parse_with_params(
        &format!("{}/{}/{}", base_url(port), args.project, args.function),
        &args.query,
    )
    .context("invalid gateway url")?;
    let method = reqwest::Method::from_bytes(args.method.as_bytes()).context("invalid --method")?;

    // The gateway reads the owner from the Host subdomain.
    let mut req = reqwest::Client::new()
        .request(method, url.clone())
        .header(reqwest::header::HOST, format!("{}.localhost", args.owner));
    if let Some(body) = &args.body {
        req = req.json(body);
    }

    let resp = req
        .send()
        .await
        .with_context(|| format!("failed to connect to peerhostd at {} (is it running?)", url))?;

    println!("{}", resp.status());
    for (name, value) in resp.headers() {
        println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
    }
    println!();

    let text = resp.text().await.context("failed to read response body")?;
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", text),
    }
    Ok(())
}
