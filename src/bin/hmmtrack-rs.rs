use anyhow::Result;
use clap::Parser;
use hmmtrack_rs::args::Arguments;
use hmmtrack_rs::compare::ConfusionMatrix;
use hmmtrack_rs::data::{self, AltSource, InputData, OutputBuffer, OutputFiles};
use hmmtrack_rs::hmm::HmmRunner;
use hmmtrack_rs::label::label_states;
use hmmtrack_rs::model::ModelParamState;

fn main() -> Result<()> {
    let cli = Arguments::parse();
    data::validate_args(&cli)?;

    let start = std::time::Instant::now();
    let input = InputData::from_args(&cli)?;

    eprintln!("{:#?}", &input.args);
    eprintln!(
        "loaded {} fixes in {} trips",
        input.tracks.nfixes(),
        input.tracks.ntrips()
    );

    if cli.to_bin_file {
        let prefix = cli.output.as_deref().unwrap_or(&cli.data_file);
        let bin_fn = format!("{prefix}.obs.bin");
        input.write_bin_file(&bin_fn)?;
        eprintln!("prepared observations written to '{bin_fn}', fit skipped");
        return Ok(());
    }

    // use a local threadpool instead of the global one so that the number of
    // threads used in this instance does not affect other instances of the
    // same program run
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cli.num_threads)
        .build()?;

    let outfiles = OutputFiles::new_from_args(&cli, cli.buffer_size_states, cli.buffer_size_bouts)?;
    let runner = HmmRunner::new(&input);

    // fit and decode both altitude sources under the pool
    let mut decoded: Vec<(AltSource, ModelParamState, Vec<String>, Vec<u8>)> = vec![];
    pool.install(|| -> Result<()> {
        for source in AltSource::ALL {
            let ms = runner.run_fit(source)?;
            let label_names: Vec<String> =
                label_states(&ms.model).iter().map(|b| b.name()).collect();
            let states = runner.decode(source, &ms.model);
            if cli.print_progress {
                eprintln!(
                    "PROGRESS\t{}\tloglik={:.4}\titerations={}\telapsed={}",
                    source.as_str(),
                    ms.model.loglik,
                    ms.iiter + 1,
                    start.elapsed().as_secs(),
                );
            }
            decoded.push((source, ms, label_names, states));
        }
        Ok(())
    })?;

    for (source, _, label_names, states) in decoded.iter() {
        let mut out = OutputBuffer::new(&outfiles, 1024, 64);
        runner.write_decoded(*source, states, label_names, &mut out, cli.suppress_bouts)?;
        out.flush_states()?;
        out.flush_bouts()?;
    }

    let fits: Vec<(AltSource, &ModelParamState, &[String])> = decoded
        .iter()
        .map(|(source, ms, names, _)| (*source, ms, names.as_slice()))
        .collect();
    data::write_params_file(&cli, &fits)?;

    // fix-by-fix agreement of the two classifications
    let (baro, gps) = (&decoded[0], &decoded[1]);
    let pairs = baro.3.iter().zip(gps.3.iter()).map(|(&sb, &sg)| {
        (
            baro.2[sb as usize].as_str(),
            gps.2[sg as usize].as_str(),
        )
    });
    let cm = ConfusionMatrix::from_pairs(pairs);
    data::write_compare_file(&cli, &cm.render_tsv())?;

    eprintln!(
        "baro/gps agreement={:.4} kappa={:.4} elapsed={}s",
        cm.agreement(),
        cm.kappa(),
        start.elapsed().as_secs(),
    );
    Ok(())
}
