use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use log::{debug, trace, warn};
use ndarray::Array1;
use rand::{
    distributions::{Distribution, Uniform},
    rngs::StdRng,
    Rng, SeedableRng,
};

use super::{Collate, PrioritizedReplayBufferConfig, WeightNormalizer};
use crate::{
    decay::{Constant, Decay, Linear},
    ds::{MinTree, RingBuffer, SumTree},
    error::{Error, Result},
    tensordict::{Field, FieldKind, TensorDict},
};

/// Field holding the storage slot of every sampled row
pub const INDEX_KEY: &str = "index";

/// Field holding the importance-sampling weight of every sampled row
pub const WEIGHT_KEY: &str = "_weight";

/// Layout shared by every stored row, fixed by the first insertion
#[derive(Debug, Clone, Default)]
struct Schema {
    row_batch: Option<Vec<usize>>,
    fields: BTreeMap<String, (FieldKind, Vec<usize>)>,
}

/// Everything guarded by the buffer lock
struct Inner {
    memory: RingBuffer<TensorDict>,
    schema: Schema,
    priorities: SumTree,
    min_priorities: MinTree,
    alpha: f32,
    beta: Box<dyn Decay + Send>,
    n_updates: usize,
    rng: StdRng,
}

impl Inner {
    fn set_priority(&mut self, slot: usize, priority: f32) {
        self.priorities.update(slot, priority);
        self.min_priorities.update(slot, priority);
    }

    /// Priority given to rows inserted without a priority signal
    fn default_priority(&self) -> f32 {
        let max = self.priorities.max();
        if max > 0.0 {
            max
        } else {
            1.0
        }
    }

    fn beta(&self) -> f32 {
        self.beta.evaluate(self.n_updates as f32)
    }

    /// Schema after storing the rows of `batch`, or a shape error if they do not fit the rows
    /// already stored
    ///
    /// Rows must keep the stored row batch shape and the element kind and shape of every known
    /// field. With `same_fields` they must also carry exactly the stored field names.
    fn check_schema(&self, batch: &TensorDict, same_fields: bool) -> Result<Schema> {
        let row_batch = batch.batch_size()[1..].to_vec();
        let keys = batch
            .keys()
            .filter(|&k| k != INDEX_KEY && k != WEIGHT_KEY)
            .collect::<Vec<_>>();

        let mut schema = self.schema.clone();
        if let Some(stored) = &schema.row_batch {
            if *stored != row_batch {
                return Err(Error::Shape(format!(
                    "stored rows have batch shape {stored:?}, got {row_batch:?}"
                )));
            }
            let stored_keys = schema.fields.keys().map(String::as_str);
            if same_fields && !stored_keys.clone().eq(keys.iter().copied()) {
                return Err(Error::Shape(format!(
                    "stored rows hold fields {:?}, got {keys:?}",
                    stored_keys.collect::<Vec<_>>()
                )));
            }
        }

        for key in keys {
            let field = batch.try_get(key)?;
            let row_shape = field.shape()[1..].to_vec();
            match schema.fields.get(key) {
                Some((kind, shape)) if *kind != field.kind() || *shape != row_shape => {
                    return Err(Error::Shape(format!(
                        "field `{key}` holds {kind:?} rows of shape {shape:?}, got {:?} rows of shape {row_shape:?}",
                        field.kind()
                    )));
                }
                Some(_) => {}
                None => {
                    schema
                        .fields
                        .insert(key.to_string(), (field.kind(), row_shape));
                }
            }
        }
        schema.row_batch = Some(row_batch);
        Ok(schema)
    }

    /// Draw `batch_size` slots with probability proportional to their priority
    ///
    /// Returns the slots and their sampling probabilities.
    fn draw(&mut self, batch_size: usize) -> (Vec<usize>, Vec<f32>) {
        let n = self.memory.len();
        let total = self.priorities.sum();

        if total <= 0.0 || !total.is_finite() {
            // every stored priority vanished, fall back to uniform draws over occupied slots
            debug!("total priority is {total}, sampling uniformly");
            let slots = (0..batch_size)
                .map(|_| self.rng.gen_range(0..n))
                .collect();
            return (slots, vec![1.0 / n as f32; batch_size]);
        }

        let dist = Uniform::new(0.0, total);
        (0..batch_size)
            .map(|_| {
                let (slot, priority) = self.priorities.find(dist.sample(&mut self.rng));
                (slot, priority / total)
            })
            .unzip()
    }

    /// Compute the importance sampling weights for each sample's probability
    fn compute_weights(&self, probs: &[f32], normalize: WeightNormalizer) -> Vec<f32> {
        let beta = self.beta();
        let n = self.memory.len() as f32;

        let weights = probs.iter().map(|p| (n * p).powf(-beta));
        let w_max = match normalize {
            WeightNormalizer::All => {
                let total = self.priorities.sum();
                match self.min_priorities.min() {
                    Some(p_min) if total > 0.0 && p_min > 0.0 => (n * p_min / total).powf(-beta),
                    _ => weights.clone().fold(f32::MIN_POSITIVE, f32::max),
                }
            }
            WeightNormalizer::Batch => weights.clone().fold(f32::MIN_POSITIVE, f32::max),
        };
        weights.map(|w| w / w_max).collect()
    }
}

/// A prioritized replay buffer over [`TensorDict`] rows, as described in [this paper](https://arxiv.org/abs/1511.05952)
///
/// Rows along the leading axis of every inserted batch are stored independently in a fixed number
/// of slots, overwriting the oldest rows once the buffer is full. Each slot carries a priority,
/// and [`sample`](PrioritizedReplayBuffer::sample) draws slots with probability proportional to it.
/// Sampled batches are copies: they carry the slot of every row under [`INDEX_KEY`], and passing
/// them back to [`update_priority`](PrioritizedReplayBuffer::update_priority) with a fresh priority
/// signal (usually the temporal difference error) re-weights those slots.
///
/// All operations take `&self` and serialize on an internal lock, so the buffer can be shared
/// between collecting and learning threads behind an `Arc`.
///
/// If a slot is overwritten between sampling and the priority update, the update lands on the new
/// occupant of the slot.
pub struct PrioritizedReplayBuffer {
    inner: Mutex<Inner>,
    collate: Box<dyn Collate>,
    same_fields: bool,
    priority_key: String,
    eps: f32,
    normalize: WeightNormalizer,
}

impl PrioritizedReplayBuffer {
    /// Build a buffer from `config`
    ///
    /// Fails with [`Error::Capacity`] for a zero capacity and [`Error::InvalidConfig`] for
    /// out-of-range exponents.
    pub fn new(config: &PrioritizedReplayBufferConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config.capacity;

        let beta: Box<dyn Decay + Send> = match &config.beta_annealing {
            Some(annealing) => Box::new(Linear::over(
                config.beta,
                annealing.beta_final,
                annealing.n_updates,
            )?),
            None => Box::new(Constant::new(config.beta)),
        };
        let rng = config
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);

        Ok(Self {
            inner: Mutex::new(Inner {
                memory: RingBuffer::new(capacity)?,
                schema: Schema::default(),
                priorities: SumTree::new(capacity),
                min_priorities: MinTree::new(capacity),
                alpha: config.alpha,
                beta,
                n_updates: 0,
                rng,
            }),
            collate: config.collate.build(),
            same_fields: true,
            priority_key: config.priority_key.clone(),
            eps: config.eps,
            normalize: config.normalize,
        })
    }

    /// Replace the collation strategy used by [`sample`](PrioritizedReplayBuffer::sample)
    ///
    /// The built-in strategies need every stored row to carry the same fields. A custom strategy
    /// is trusted to reconcile rows with differing field sets, so inserted batches are then only
    /// checked field by field.
    pub fn with_collate(mut self, collate: impl Collate + 'static) -> Self {
        self.collate = Box::new(collate);
        self.same_fields = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("replay buffer lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// `(|p| + eps)^alpha`, which must stay finite
    fn exponentiate(&self, priority: f32, alpha: f32) -> Result<f32> {
        let exponentiated = (priority.abs() + self.eps).powf(alpha);
        if !priority.is_finite() || !exponentiated.is_finite() {
            return Err(Error::InvalidPriority(priority));
        }
        Ok(exponentiated)
    }

    /// Insert every row along the leading axis of `batch` and return the slots written
    ///
    /// Rows take their priority from the configured priority field when `batch` carries it, and
    /// otherwise the largest priority stored so far. Synthetic [`INDEX_KEY`] and [`WEIGHT_KEY`]
    /// fields of a previously sampled batch are not stored.
    ///
    /// The whole batch is validated before the first slot is written.
    pub fn extend(&self, batch: &TensorDict) -> Result<Vec<usize>> {
        if batch.batch_size().is_empty() {
            return Err(Error::Shape(String::from(
                "inserted records need a leading batch axis",
            )));
        }

        let rows = (0..batch.len())
            .map(|i| {
                let mut row = batch.index(i)?;
                row.remove(INDEX_KEY);
                row.remove(WEIGHT_KEY);
                Ok(row)
            })
            .collect::<Result<Vec<_>>>()?;
        let signal = batch
            .get(&self.priority_key)
            .map(Field::abs_max_rows)
            .transpose()?;

        let mut guard = self.lock();
        let inner = &mut *guard;

        let schema = inner.check_schema(batch, self.same_fields)?;
        let priorities = match signal {
            Some(signal) => signal
                .into_iter()
                .map(|p| self.exponentiate(p, inner.alpha))
                .collect::<Result<Vec<_>>>()?,
            None => vec![inner.default_priority(); rows.len()],
        };
        if !rows.is_empty() {
            inner.schema = schema;
        }

        let mut slots = Vec::with_capacity(rows.len());
        for (row, priority) in rows.into_iter().zip(priorities) {
            let slot = inner.memory.push(row);
            inner.set_priority(slot, priority);
            slots.push(slot);
        }

        debug!(
            "extended replay buffer with {} rows, {} / {} slots occupied",
            slots.len(),
            inner.memory.len(),
            inner.memory.capacity()
        );
        Ok(slots)
    }

    /// Sample a batch of `batch_size` rows drawn independently by priority
    ///
    /// The result is an owned copy collated by the configured strategy, with its batch shape
    /// reduced to the leading axis and the sampled slots stored under [`INDEX_KEY`].
    pub fn sample(&self, batch_size: usize) -> Result<TensorDict> {
        self.sample_impl(batch_size, false)
    }

    /// Like [`sample`](PrioritizedReplayBuffer::sample), additionally storing importance-sampling
    /// weights `(N * P(i))^-beta` under [`WEIGHT_KEY`], normalized per the configured
    /// [`WeightNormalizer`]
    pub fn sample_with_weights(&self, batch_size: usize) -> Result<TensorDict> {
        self.sample_impl(batch_size, true)
    }

    fn sample_impl(&self, batch_size: usize, return_weight: bool) -> Result<TensorDict> {
        if batch_size == 0 {
            return Err(Error::InvalidBatchSize(batch_size));
        }

        let (rows, slots, weights) = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if inner.memory.len() == 0 {
                return Err(Error::EmptyBuffer);
            }

            let (slots, probs) = inner.draw(batch_size);
            let len = inner.memory.len();
            let rows = slots
                .iter()
                .map(|&slot| {
                    inner
                        .memory
                        .get(slot)
                        .cloned()
                        .ok_or(Error::IndexOutOfBounds { index: slot, len })
                })
                .collect::<Result<Vec<_>>>()?;
            let weights = return_weight.then(|| inner.compute_weights(&probs, self.normalize));
            trace!("sampled slots {slots:?}");
            (rows, slots, weights)
        };

        let row_lens = rows.iter().map(TensorDict::len).collect::<Vec<_>>();
        let mut batch = self.collate.collate(rows)?;

        // one entry of `index` per output row, whatever layout the strategy chose
        let repeats = if batch.len() == batch_size {
            vec![1; batch_size]
        } else if !batch.batch_size().is_empty() && batch.len() == row_lens.iter().sum::<usize>() {
            row_lens
        } else {
            return Err(Error::Shape(format!(
                "collated batch has {} rows for {batch_size} samples",
                batch.len()
            )));
        };
        let expand = |values: &[f32]| -> Vec<f32> {
            values
                .iter()
                .zip(&repeats)
                .flat_map(|(&v, &r)| std::iter::repeat(v).take(r))
                .collect()
        };

        let len = batch.len();
        batch.set_batch_size([len])?;
        let index = slots
            .iter()
            .zip(&repeats)
            .flat_map(|(&slot, &r)| std::iter::repeat(slot as i64).take(r))
            .collect::<Array1<_>>();
        batch.set(INDEX_KEY, Field::from(index))?;
        if let Some(weights) = weights {
            batch.set(WEIGHT_KEY, Field::from(Array1::from(expand(&weights))))?;
        }
        Ok(batch)
    }

    /// Overwrite the priority of every slot named by the [`INDEX_KEY`] field of `batch` with the
    /// batch's priority field raised to `alpha`
    ///
    /// Rows sharing a slot collapse to their largest priority. Only priorities change, stored
    /// rows are untouched.
    pub fn update_priority(&self, batch: &TensorDict) -> Result<()> {
        let index = batch.try_get(INDEX_KEY)?;
        let signal = batch.try_get(&self.priority_key)?;

        let slots = index
            .as_int()
            .ok_or_else(|| Error::Shape(format!("`{INDEX_KEY}` must hold integers")))?;
        if slots.ndim() == 0 || slots.len() != slots.shape()[0] {
            return Err(Error::Shape(format!(
                "`{INDEX_KEY}` must hold one slot per row, got shape {:?}",
                slots.shape()
            )));
        }
        let signal = signal.abs_max_rows()?;
        if signal.len() != slots.len() {
            return Err(Error::Shape(format!(
                "{} priorities for {} slots",
                signal.len(),
                slots.len()
            )));
        }

        let mut updates = BTreeMap::<usize, f32>::new();
        for (&slot, p) in slots.iter().zip(signal) {
            let slot = usize::try_from(slot)
                .map_err(|_| Error::Shape(format!("negative slot index {slot}")))?;
            let entry = updates.entry(slot).or_insert(p);
            *entry = entry.max(p);
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        let len = inner.memory.len();
        if let Some(&slot) = updates.keys().find(|&&slot| slot >= len) {
            return Err(Error::IndexOutOfBounds { index: slot, len });
        }

        let priorities = updates
            .into_iter()
            .map(|(slot, p)| Ok((slot, self.exponentiate(p, inner.alpha)?)))
            .collect::<Result<Vec<_>>>()?;
        for &(slot, priority) in &priorities {
            inner.set_priority(slot, priority);
        }
        inner.n_updates += 1;

        trace!("updated priorities {priorities:?}");
        Ok(())
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.lock().memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().memory.capacity()
    }

    /// Total number of rows ever inserted
    pub fn writes(&self) -> u64 {
        self.lock().memory.writes()
    }

    pub fn priority_key(&self) -> &str {
        &self.priority_key
    }

    /// Stored (exponentiated) priority of a slot, `None` if the slot was never written
    pub fn priority(&self, slot: usize) -> Option<f32> {
        let inner = self.lock();
        inner
            .memory
            .get(slot)
            .map(|_| inner.priorities.get(slot))
    }

    /// Sum of all stored priorities
    pub fn total_priority(&self) -> f32 {
        self.lock().priorities.sum()
    }

    pub fn alpha(&self) -> f32 {
        self.lock().alpha
    }

    /// Change the priority exponent applied to priorities inserted or updated from now on
    pub fn set_alpha(&self, alpha: f32) -> Result<()> {
        check_exponent("alpha", alpha)?;
        self.lock().alpha = alpha;
        Ok(())
    }

    /// Current importance-sampling exponent
    pub fn beta(&self) -> f32 {
        self.lock().beta()
    }

    /// Fix the importance-sampling exponent, replacing any annealing schedule
    pub fn set_beta(&self, beta: f32) -> Result<()> {
        check_exponent("beta", beta)?;
        self.lock().beta = Box::new(Constant::new(beta));
        Ok(())
    }
}

fn check_exponent(name: &str, value: f32) -> Result<()> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!(
            "`{name}` must be finite and non-negative, got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc, thread};

    use ndarray::{arr1, Array2};
    use rand::Rng;
    use rand_distr::StandardNormal;
    use statrs::distribution::{ChiSquared, ContinuousCDF};

    use super::*;
    use crate::memory::CollateKind;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn randn(rng: &mut StdRng, shape: &[usize]) -> Field {
        let n = shape.iter().product();
        let values = (0..n).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
        Field::float(shape, values).unwrap()
    }

    fn uniform(rng: &mut StdRng, shape: &[usize], scale: f32) -> Field {
        let n = shape.iter().product();
        let values = (0..n).map(|_| rng.gen::<f32>() * scale).collect();
        Field::float(shape, values).unwrap()
    }

    fn ints(field: &Field) -> Vec<usize> {
        field.as_int().unwrap().iter().map(|&i| i as usize).collect()
    }

    fn buffer(config: PrioritizedReplayBufferConfig) -> PrioritizedReplayBuffer {
        PrioritizedReplayBuffer::new(&config).unwrap()
    }

    /// Rows carrying their insertion number under `id`, without priorities
    fn ids(range: std::ops::Range<i64>) -> TensorDict {
        let ids = range.collect::<Array1<_>>();
        TensorDict::new([ids.len()]).with("id", ids).unwrap()
    }

    fn transitions(rng: &mut StdRng, n: usize, priority_key: &str) -> TensorDict {
        TensorDict::from_fields(
            [
                ("a", randn(rng, &[n, 1])),
                (priority_key, uniform(rng, &[n, 1], 0.1)),
                (
                    "_idx",
                    Field::from((0..n as i64).collect::<Array1<_>>().into_shape((n, 1)).unwrap()),
                ),
            ],
            [n],
        )
        .unwrap()
    }

    fn prioritized_replay(priority_key: &str, stack_with_closure: bool) {
        init_logger();
        let mut rng = StdRng::seed_from_u64(0);
        let config = PrioritizedReplayBufferConfig::default()
            .capacity(5)
            .alpha(0.7)
            .beta(0.9)
            .priority_key(priority_key)
            .seed(Some(0));
        let mut rb = buffer(config);
        if stack_with_closure {
            rb = rb.with_collate(|rows: Vec<TensorDict>| TensorDict::stack(&rows));
        }

        let td1 = transitions(&mut rng, 3, priority_key);
        rb.extend(&td1).unwrap();
        let s = rb.sample(2).unwrap();
        assert_eq!(s.batch_size(), [2]);
        let picked = td1.select_rows(&ints(s.get("_idx").unwrap())).unwrap();
        assert!(picked
            .select(&["a"])
            .unwrap()
            .allclose(&s.select(&["a"]).unwrap(), 1e-6, 1e-8));

        // test replacement
        let mut td2 = transitions(&mut rng, 5, priority_key);
        rb.extend(&td2).unwrap();
        let mut s = rb.sample(5).unwrap();
        assert_eq!(s.batch_size(), [5]);
        let picked = td2.select_rows(&ints(s.get("_idx").unwrap())).unwrap();
        assert_eq!(picked.select(&["a"]).unwrap(), s.select(&["a"]).unwrap());

        // test strong update
        let idx = ints(s.get("_idx").unwrap());
        let matching = (0..idx.len())
            .filter(|&i| idx[i] == idx[0])
            .collect::<Vec<_>>();
        let boost = Field::from(Array2::from_elem((matching.len(), 1), 1e8f32));
        s.set_at(priority_key, &boost, &matching).unwrap();
        let val = s.get("a").unwrap().row(0).unwrap();
        rb.update_priority(&s).unwrap();

        let s = rb.sample(5).unwrap();
        let a = s.get("a").unwrap();
        let hits = (0..5).filter(|&i| a.row(i).unwrap() == val).count();
        assert!(hits >= 1, "boosted row was drawn");
        assert_eq!(hits, 5, "boosted row dominates every draw");
        assert_eq!(td2.index(idx[0]).unwrap().get("a"), Some(&val));

        // sampled rows are copies, later writes to the source do not leak into storage
        td2.get_mut("a").unwrap().as_float_mut().unwrap().fill(1.0);
        let s = rb.sample(5).unwrap();
        assert!(s.get("a").unwrap().row(0).unwrap() == val);
    }

    #[test]
    fn prioritized_replay_default_key() {
        prioritized_replay("td_error", false);
    }

    #[test]
    fn prioritized_replay_custom_key() {
        prioritized_replay("pk", false);
    }

    #[test]
    fn prioritized_replay_stack_closure() {
        prioritized_replay("pk", true);
        prioritized_replay("td_error", true);
    }

    #[test]
    fn trajectories() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(1);
        let traj = TensorDict::from_fields(
            [
                ("obs", randn(&mut rng, &[3, 4, 5])),
                ("actions", randn(&mut rng, &[3, 4, 2])),
            ],
            [3, 4],
        )
        .unwrap();
        let rb = buffer(
            PrioritizedReplayBufferConfig::default()
                .capacity(5)
                .alpha(0.7)
                .beta(0.9)
                .seed(Some(1)),
        );
        rb.extend(&traj).unwrap();
        assert_eq!(rb.len(), 3);

        let mut sampled = rb.sample(3).unwrap();
        sampled.set("td_error", uniform(&mut rng, &[3], 1.0)).unwrap();
        rb.update_priority(&sampled).unwrap();

        let sampled = rb.sample_with_weights(3).unwrap();
        let weights = sampled.get(WEIGHT_KEY).unwrap().as_float().unwrap();
        assert!(weights.iter().all(|&w| w > 0.0 && w <= 1.0));
        assert_eq!(sampled.batch_size(), [3]);

        // set back the trajectory length
        let mut filtered = sampled.exclude(&[WEIGHT_KEY, INDEX_KEY]);
        filtered.set_batch_size([3, 4]).unwrap();
        assert_eq!(filtered.get("obs").unwrap().shape(), [3, 4, 5]);
    }

    #[test]
    fn trajectories_concatenated() {
        let mut rng = StdRng::seed_from_u64(2);
        let traj = TensorDict::new([3, 4])
            .with("obs", Array2::<f32>::zeros((3, 4)))
            .unwrap()
            .with("td_error", uniform(&mut rng, &[3, 4], 1.0))
            .unwrap();
        let rb = buffer(
            PrioritizedReplayBufferConfig::default()
                .capacity(5)
                .collate(CollateKind::Concat)
                .seed(Some(2)),
        );
        rb.extend(&traj).unwrap();

        let sampled = rb.sample_with_weights(3).unwrap();
        assert_eq!(sampled.batch_size(), [12]);
        let index = ints(sampled.get(INDEX_KEY).unwrap());
        assert_eq!(index.len(), 12);
        for chunk in index.chunks(4) {
            assert!(chunk.iter().all(|&slot| slot == chunk[0]), "slot repeated per step");
        }
        assert_eq!(sampled.get(WEIGHT_KEY).unwrap().shape(), [12]);

        // one row per step collapses back onto its slot
        rb.update_priority(&sampled).unwrap();
    }

    #[test]
    fn samples_only_occupied_slots() {
        let rb = buffer(PrioritizedReplayBufferConfig::default().capacity(8).seed(Some(3)));
        rb.extend(&ids(0..3)).unwrap();
        for _ in 0..50 {
            let s = rb.sample(4).unwrap();
            assert!(ints(s.get(INDEX_KEY).unwrap()).iter().all(|&slot| slot < 3));
        }
        assert_eq!(rb.priority(3), None);
    }

    #[test]
    fn oldest_rows_are_evicted() {
        let rb = buffer(PrioritizedReplayBufferConfig::default().capacity(5).seed(Some(4)));
        assert_eq!(rb.extend(&ids(0..3)).unwrap(), [0, 1, 2]);
        assert_eq!(rb.extend(&ids(3..8)).unwrap(), [3, 4, 0, 1, 2]);
        assert_eq!(rb.len(), 5);
        assert_eq!(rb.writes(), 8);

        let mut seen = HashMap::new();
        for _ in 0..40 {
            let s = rb.sample(5).unwrap();
            let slots = ints(s.get(INDEX_KEY).unwrap());
            let id = s.get("id").unwrap().as_int().unwrap();
            for (&slot, &id) in slots.iter().zip(id.iter()) {
                assert!(id >= 3, "first batch fully evicted");
                assert_eq!(slot, id as usize % 5, "slot holds its latest write");
                seen.insert(slot, id);
            }
        }
        assert_eq!(seen.len(), 5, "every slot reachable");
    }

    #[test]
    fn default_priority_tracks_maximum() {
        let rb = buffer(
            PrioritizedReplayBufferConfig::default()
                .capacity(4)
                .alpha(1.0)
                .eps(0.0)
                .seed(Some(5)),
        );
        rb.extend(&ids(0..1)).unwrap();
        assert_eq!(rb.priority(0), Some(1.0), "first rows default to 1");

        let mut s = rb.sample(1).unwrap();
        s.set("td_error", arr1(&[-3.0f32]).into()).unwrap();
        rb.update_priority(&s).unwrap();
        assert_eq!(rb.priority(0), Some(3.0), "absolute value of the signal");

        rb.extend(&ids(1..2)).unwrap();
        assert_eq!(rb.priority(1), Some(3.0), "later rows inherit the maximum");
        assert_eq!(rb.total_priority(), 6.0);

        let rb = buffer(
            PrioritizedReplayBufferConfig::default()
                .alpha(1.0)
                .eps(0.0)
                .seed(Some(5)),
        );
        let explicit = ids(0..1).with("td_error", arr1(&[-3.0f32])).unwrap();
        rb.extend(&explicit).unwrap();
        assert_eq!(rb.priority(0), Some(3.0), "signal on insertion");
    }

    #[test]
    fn sampling_follows_priorities() {
        let rb = buffer(
            PrioritizedReplayBufferConfig::default()
                .capacity(4)
                .alpha(1.0)
                .eps(0.0)
                .seed(Some(6)),
        );
        let batch = ids(0..4)
            .with("td_error", arr1(&[1.0f32, 2.0, 3.0, 4.0]))
            .unwrap();
        rb.extend(&batch).unwrap();

        let draws = 20_000;
        let mut counts = [0usize; 4];
        for _ in 0..draws / 100 {
            let s = rb.sample(100).unwrap();
            for slot in ints(s.get(INDEX_KEY).unwrap()) {
                counts[slot] += 1;
            }
        }

        let chi2: f64 = counts
            .iter()
            .enumerate()
            .map(|(slot, &observed)| {
                let expected = draws as f64 * (slot + 1) as f64 / 10.0;
                (observed as f64 - expected).powi(2) / expected
            })
            .sum();
        let critical = ChiSquared::new(3.0).unwrap().inverse_cdf(0.999);
        assert!(chi2 < critical, "chi2 {chi2} exceeds {critical} for counts {counts:?}");
    }

    #[test]
    fn sampling_leaves_priorities_untouched() {
        let mut rng = StdRng::seed_from_u64(7);
        let rb = buffer(PrioritizedReplayBufferConfig::default().capacity(6).seed(Some(7)));
        rb.extend(&transitions(&mut rng, 6, "td_error")).unwrap();

        let before = (0..6).map(|slot| rb.priority(slot)).collect::<Vec<_>>();
        let total = rb.total_priority();
        for _ in 0..20 {
            rb.sample_with_weights(8).unwrap();
        }
        assert_eq!((0..6).map(|slot| rb.priority(slot)).collect::<Vec<_>>(), before);
        assert_eq!(rb.total_priority(), total);
    }

    #[test]
    fn importance_weights() {
        let config = PrioritizedReplayBufferConfig::default()
            .capacity(2)
            .alpha(1.0)
            .beta(1.0)
            .eps(0.0)
            .seed(Some(8));
        let batch = ids(0..2)
            .with("td_error", arr1(&[1.0f32, 3.0]))
            .unwrap();

        // P = [0.25, 0.75] so w = (2 * P)^-1 = [2, 2/3]
        let expected = |normalize: WeightNormalizer, slot: usize, batch_max: f32| match (normalize, slot) {
            (WeightNormalizer::All, 0) => 1.0,
            (WeightNormalizer::All, _) => 1.0 / 3.0,
            (WeightNormalizer::Batch, 0) => 2.0 / batch_max,
            (WeightNormalizer::Batch, _) => (2.0 / 3.0) / batch_max,
        };

        for normalize in [WeightNormalizer::All, WeightNormalizer::Batch] {
            let rb = buffer(config.clone().normalize(normalize));
            rb.extend(&batch).unwrap();
            for _ in 0..20 {
                let s = rb.sample_with_weights(4).unwrap();
                let slots = ints(s.get(INDEX_KEY).unwrap());
                let weights = s.get(WEIGHT_KEY).unwrap().as_float().unwrap();
                let batch_max = if slots.contains(&0) { 2.0 } else { 2.0 / 3.0 };
                for (&slot, &w) in slots.iter().zip(weights.iter()) {
                    let want = expected(normalize, slot, batch_max);
                    assert!((w - want).abs() < 1e-5, "{normalize:?} slot {slot}: {w} != {want}");
                }
            }
        }
    }

    #[test]
    fn beta_annealing_and_setters() {
        let rb = buffer(
            PrioritizedReplayBufferConfig::default()
                .capacity(4)
                .beta(0.4)
                .beta_annealing(1.0, 2)
                .seed(Some(9)),
        );
        rb.extend(&ids(0..2)).unwrap();
        assert!((rb.beta() - 0.4).abs() < 1e-6);

        let mut s = rb.sample(2).unwrap();
        s.set("td_error", Field::zeros(&[2])).unwrap();
        rb.update_priority(&s).unwrap();
        assert!((rb.beta() - 0.7).abs() < 1e-6);
        rb.update_priority(&s).unwrap();
        rb.update_priority(&s).unwrap();
        assert_eq!(rb.beta(), 1.0, "schedule saturates");

        rb.set_beta(0.5).unwrap();
        assert_eq!(rb.beta(), 0.5);
        assert!(rb.set_beta(-1.0).is_err());

        rb.set_alpha(0.0).unwrap();
        assert_eq!(rb.alpha(), 0.0);
        let mut s = rb.sample(1).unwrap();
        s.set("td_error", arr1(&[5.0f32]).into()).unwrap();
        rb.update_priority(&s).unwrap();
        let slot = ints(s.get(INDEX_KEY).unwrap())[0];
        assert_eq!(rb.priority(slot), Some(1.0), "alpha 0 flattens priorities");
    }

    #[test]
    fn stale_index_updates_new_occupant() {
        let rb = buffer(
            PrioritizedReplayBufferConfig::default()
                .capacity(2)
                .alpha(1.0)
                .eps(0.0)
                .seed(Some(10)),
        );
        rb.extend(&ids(0..2)).unwrap();
        let mut s = rb.sample(1).unwrap();
        let slot = ints(s.get(INDEX_KEY).unwrap())[0];

        // wrap the cursor past the sampled slot
        rb.extend(&ids(2..4)).unwrap();
        s.set("td_error", arr1(&[9.0f32]).into()).unwrap();
        rb.update_priority(&s).unwrap();
        assert_eq!(rb.priority(slot), Some(9.0));
    }

    #[test]
    fn errors() {
        assert!(matches!(
            PrioritizedReplayBuffer::new(&PrioritizedReplayBufferConfig::default().capacity(0)),
            Err(Error::Capacity(0))
        ));

        let rb = buffer(PrioritizedReplayBufferConfig::default().capacity(4).seed(Some(11)));
        assert!(matches!(rb.sample(1), Err(Error::EmptyBuffer)));

        let mut rng = StdRng::seed_from_u64(11);
        rb.extend(&transitions(&mut rng, 2, "td_error")).unwrap();
        assert!(matches!(rb.sample(0), Err(Error::InvalidBatchSize(0))));

        // field `a` was stored with rows of shape [1]
        let wide = TensorDict::new([2]).with("a", Array2::<f32>::zeros((2, 3))).unwrap();
        assert!(matches!(rb.extend(&wide), Err(Error::Shape(_))));
        let ints_a = TensorDict::new([2]).with("a", Array2::<i64>::zeros((2, 1))).unwrap();
        assert!(matches!(rb.extend(&ints_a), Err(Error::Shape(_))));
        assert_eq!(rb.len(), 2, "rejected batches write nothing");
        assert!(matches!(
            rb.extend(&TensorDict::new(Vec::<usize>::new()).with("a", arr1(&[1.0f32])).unwrap()),
            Err(Error::Shape(_))
        ));

        let s = rb.sample(2).unwrap();
        assert!(matches!(
            rb.update_priority(&s.exclude(&[INDEX_KEY])),
            Err(Error::MissingKey(_))
        ));
        assert!(matches!(
            rb.update_priority(&s.exclude(&["td_error"])),
            Err(Error::MissingKey(_))
        ));

        let mut far = s.clone();
        far.set(INDEX_KEY, arr1(&[0i64, 3]).into()).unwrap();
        assert!(matches!(
            rb.update_priority(&far),
            Err(Error::IndexOutOfBounds { index: 3, len: 2 })
        ));

        let mut nan = s;
        nan.set("td_error", arr1(&[f32::NAN, 1.0]).into()).unwrap();
        assert!(matches!(rb.update_priority(&nan), Err(Error::InvalidPriority(_))));

        // every stored row carries the same fields
        let rb = buffer(PrioritizedReplayBufferConfig::default().capacity(8).seed(Some(11)));
        rb.extend(&ids(0..2)).unwrap();
        let extra = ids(2..4).with("td_error", arr1(&[0.5f32, 0.5])).unwrap();
        assert!(matches!(rb.extend(&extra), Err(Error::Shape(_))));
        assert_eq!(rb.len(), 2, "rejected batches write nothing");

        // and the same row batch shape
        let traj = TensorDict::new([3, 4])
            .with("obs", Array2::<f32>::zeros((3, 4)))
            .unwrap();
        let rb = buffer(PrioritizedReplayBufferConfig::default().capacity(8).seed(Some(11)));
        rb.extend(&traj).unwrap();
        let sampled = rb.sample(2).unwrap();
        assert_eq!(sampled.get("obs").unwrap().shape(), [2, 4]);
        assert!(matches!(rb.extend(&sampled), Err(Error::Shape(_))));
        assert_eq!(rb.len(), 3, "rejected batches write nothing");
        let mut restored = sampled.exclude(&[INDEX_KEY]);
        restored.set_batch_size([2, 4]).unwrap();
        assert_eq!(rb.extend(&restored).unwrap(), [3, 4]);

        // priorities overflowing once raised to alpha
        let rb = buffer(
            PrioritizedReplayBufferConfig::default()
                .alpha(100.0)
                .eps(0.0)
                .seed(Some(11)),
        );
        let huge = ids(0..1).with("td_error", arr1(&[10.0f32])).unwrap();
        assert!(matches!(rb.extend(&huge), Err(Error::InvalidPriority(_))));
        assert!(rb.is_empty());
    }

    #[test]
    fn custom_collate_accepts_differing_fields() {
        let rb = buffer(PrioritizedReplayBufferConfig::default().capacity(4).seed(Some(13)))
            .with_collate(|rows: Vec<TensorDict>| {
                let rows = rows
                    .iter()
                    .map(|row| row.select(&["id"]))
                    .collect::<Result<Vec<_>>>()?;
                TensorDict::stack(&rows)
            });
        rb.extend(&ids(0..2)).unwrap();
        let extra = ids(2..4).with("td_error", arr1(&[0.5f32, 0.5])).unwrap();
        rb.extend(&extra).unwrap();

        let s = rb.sample(8).unwrap();
        assert_eq!(s.keys().collect::<Vec<_>>(), ["id", INDEX_KEY]);

        // field shapes are still enforced
        let wide = TensorDict::new([1]).with("id", Array2::<i64>::zeros((1, 2))).unwrap();
        assert!(matches!(rb.extend(&wide), Err(Error::Shape(_))));
    }

    #[test]
    fn concurrent_extend_and_sample() {
        let rb = Arc::new(buffer(
            PrioritizedReplayBufferConfig::default()
                .capacity(64)
                .alpha(1.0)
                .eps(0.0)
                .seed(Some(12)),
        ));

        thread::scope(|scope| {
            for t in 0..4 {
                let rb = Arc::clone(&rb);
                scope.spawn(move || {
                    for i in 0..50 {
                        let row = ids(i..i + 1)
                            .with("td_error", arr1(&[(t + 1) as f32]))
                            .unwrap();
                        rb.extend(&row).unwrap();
                        let s = rb.sample(4).unwrap();
                        assert!(ints(s.get(INDEX_KEY).unwrap())
                            .iter()
                            .all(|&slot| slot < rb.capacity()));
                    }
                });
            }
        });

        assert_eq!(rb.writes(), 200);
        assert_eq!(rb.len(), 64);
        let total = (0..64).filter_map(|slot| rb.priority(slot)).sum::<f32>();
        assert!((rb.total_priority() - total).abs() < 1e-3, "tree consistent with its leaves");
    }
}
