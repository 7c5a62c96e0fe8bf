use k8s_openapi::api::core::v1::Namespace;
use kube::api::ListParams;
use kube::{Api, Client};

use signal_processor::crd::SignalProcessing;

pub async fn run() -> anyhow::Result<()> {
    println!("Running cluster connectivity checks...\n");

    // 1. Build Kubernetes client from kubeconfig
    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    // 2. Verify actual cluster connectivity by fetching server version
    print!("  Cluster connection .......... ");
    let version = match client.apiserver_version().await {
        Ok(v) => {
            println!("OK (v{}.{})", v.major, v.minor);
            Some(v)
        }
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    };

    // 3. SignalProcessing CRD installed and listable
    print!("  SignalProcessing CRD ........ ");
    let signals: Api<SignalProcessing> = Api::all(client.clone());
    match signals.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({e}) - run: signal-processor crd install"),
    }

    // 4. List namespaces permission (needed by the enricher)
    print!("  List namespaces permission .. ");
    let namespaces: Api<Namespace> = Api::all(client.clone());
    match namespaces.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({e})"),
    }

    if let Some(v) = version {
        println!("\n  Kubernetes version: {}.{}", v.major, v.minor);
    }

    println!("\nAll checks completed.");
    Ok(())
}
