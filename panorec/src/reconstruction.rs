//! # Incremental reconstruction driver

use crate::aggregation::aggregate;
use crate::entity::{Model, Structure, Transform, Viewpoint};
use crate::prelude::v1::*;
use log::*;

/// Incremental reconstruction.
///
/// Every pushed frame forms one batch: the frame is appended as a viewpoint, its features are
/// aggregated into structures, and the history is refined according to the window mode.
pub struct Reconstruction {
    settings: Settings,
    model: Model,
    controller: WindowController,
    engine: RefinementEngine,
    batch: usize,
}

impl Reconstruction {
    /// Create a new reconstruction.
    ///
    /// Fails if the settings do not validate.
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;

        Ok(Self {
            settings,
            model: Model::default(),
            controller: WindowController::new(settings.group, settings.mass),
            engine: RefinementEngine::new(settings),
            batch: 0,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Current window mode.
    pub fn mode(&self) -> Mode {
        self.controller.mode()
    }

    /// Number of processed batches.
    pub fn batches(&self) -> usize {
        self.batch
    }

    pub fn viewpoints(&self) -> &[Viewpoint] {
        &self.model.viewpoints
    }

    pub fn structures(&self) -> &[Structure] {
        &self.model.structures
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.model.transforms
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Process a single frame.
    ///
    /// The frame's match table must cover exactly `min(match_range, viewpoints)` slots, where
    /// `viewpoints` is the history length before the push.
    pub fn push(&mut self, frame: Frame) -> Result<()> {
        let index = self.model.viewpoints.len();
        let slots = self.settings.match_range.min(index);

        if frame.matches.slots() != slots {
            bail!(
                "frame {} is matched against {} viewpoints, expected {}",
                index,
                frame.matches.slots(),
                slots
            );
        }

        if frame.matches.features() != frame.features.len() {
            bail!(
                "frame {} has {} features, but its match table covers {}",
                index,
                frame.features.len(),
                frame.matches.features()
            );
        }

        let vp = self.model.push_viewpoint(frame.features);
        let report = aggregate(&mut self.model, vp, &frame.matches)?;

        debug!("aggregated viewpoint {}: {:?}", vp, report);

        if !self.model.transforms.is_empty() {
            match self.controller.mode() {
                Mode::Mass => self.pass()?,
                Mode::Boot => {
                    self.pass()?;
                    self.controller.advance(self.model.viewpoints.len());
                }
                _ => {
                    self.pass()?;
                    self.controller.advance(self.model.viewpoints.len());
                    self.pass()?;
                    self.controller.advance(self.model.viewpoints.len());
                }
            }
        }

        info!(
            "batch {}: {} viewpoints, {} structures",
            self.batch,
            self.model.viewpoints.len(),
            self.model.structures.len()
        );

        self.batch += 1;

        Ok(())
    }

    /// Single refinement pass in the current mode.
    fn pass(&mut self) -> Result<()> {
        let mode = self.controller.mode();

        self.controller.prepare_structures(&mut self.model);
        let state = self.controller.prepare_state(&self.model);

        let convergence = self.engine.refine(&mut self.model, &state, mode)?;

        let expunged = WindowController::expunge_structures(&mut self.model);

        debug!(
            "{:?} pass: {} iterations, error {}, {} structures expunged",
            mode, convergence.iterations, convergence.error, expunged
        );

        Ok(())
    }

    /// Drain a source, exporting the model after every batch.
    ///
    /// Returns the number of processed batches.
    pub fn run(
        &mut self,
        source: &mut (impl ViewpointSource + ?Sized),
        exporter: &mut (impl Exporter + ?Sized),
    ) -> Result<usize> {
        let start = self.batch;

        while let Some(frame) = source.next()? {
            let batch = self.batch;
            self.push(frame)?;
            exporter.export(batch, &self.model)?;
        }

        Ok(self.batch - start)
    }
}
