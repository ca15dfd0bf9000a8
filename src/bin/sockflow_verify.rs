//! Loads each BPF object variant against the running kernel and exits
//! non-zero on the first verifier rejection. Useful as a smoke test on
//! a new kernel before deploying the tracer.

use anyhow::Result;

use sockflow::{InFlowTracer, StreamingTracer, Tracer, TracerParams};

fn main() -> Result<()> {
    let params = TracerParams::default();

    eprintln!("Loading aggregating tracer...");
    Tracer::new(&params)?.close();

    eprintln!("Loading in-flow aggregating tracer...");
    InFlowTracer::new(&params)?.close();

    eprintln!("Loading streaming tracer...");
    StreamingTracer::new(&params)?.close();

    eprintln!("BPF programs have been verified.");
    Ok(())
}
