//! Calls: dispatch on the callee, argument binding and frame setup.
//!
//! Every call works on the top of the value stack: the callee followed by `argc`
//! argument values. A call whose argument list carries keywords or expansions ends
//! with a `Kwargs(n)` count preceded by `n` pairs, each either `name, value` or an
//! expansion marker and its operand.
//!
//! The result of every call lands at `out_slots`, the stack index of the callee.

use smallvec::SmallVec;

use super::{CallFrame, FrameExit, Vm};
use crate::{
    builtins,
    exception_private::{ExcType, RunError, RunResult, format_param_names},
    heap::{HeapData, HeapId},
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{BoundMethod, CodeFlags, NativeTarget, Payload, SpecialMethod},
    value::{KWARGS_DICT, KWARGS_LIST, KWARGS_SINGLE, KWARGS_UNSET, Value},
};

/// What the run loop does after a call instruction.
#[derive(Debug)]
pub(crate) enum CallResult {
    /// The call completed; push this value.
    Push(Value),
    /// A frame was pushed; execution continues in the callee.
    FramePushed,
}

/// Arguments decoded from a call with keywords or expansions.
struct CallArgs {
    positional: Vec<Value>,
    keywords: Vec<(Value, Value)>,
}

impl<T: ResourceTracker, Tr: VmTracer> Vm<T, Tr> {
    /// Calls the value below the top `argc` stack values.
    pub(crate) fn call_value(&mut self, argc: usize) -> RunResult<CallResult> {
        let out_slots = self.thread.stack.len() - argc - 1;
        let callee = self.thread.stack[out_slots];
        self.call_at(callee, argc, out_slots)
    }

    /// Calls `callee` with the top `argc` stack values; the result goes to `out_slots`.
    ///
    /// Whatever sits at `out_slots` keeps `callee` reachable during the call.
    fn call_at(&mut self, callee: Value, argc: usize, out_slots: usize) -> RunResult<CallResult> {
        let Value::Ref(id) = callee else {
            return Err(ExcType::not_callable(&self.heap.type_name(callee)));
        };
        match self.heap.get(id) {
            HeapData::Closure(_) => self.call_closure(id, argc, out_slots),
            HeapData::Native(native) => {
                let target = native.target;
                self.call_native(target, argc, out_slots)
            }
            HeapData::BoundMethod(bound) => {
                let BoundMethod { receiver, method } = *bound;
                self.insert_receiver(argc, receiver);
                self.call_at(method, argc + 1, out_slots)
            }
            HeapData::Class(_) => self.call_class(id, argc, out_slots),
            HeapData::Instance(instance) => match self.heap.class(instance.class).special(SpecialMethod::Call) {
                Some(method) => {
                    self.insert_receiver(argc, callee);
                    self.call_at(method, argc + 1, out_slots)
                }
                None => Err(ExcType::not_callable(&self.heap.type_name(callee))),
            },
            _ => Err(ExcType::not_callable(&self.heap.type_name(callee))),
        }
    }

    /// Makes `receiver` the first of the top `argc` arguments.
    fn insert_receiver(&mut self, argc: usize, receiver: Value) {
        let at = self.thread.stack.len() - argc;
        self.thread.stack.insert(at, receiver);
    }

    /// Calls the value below the top `argc` stack values and runs it to completion.
    ///
    /// This is how natives call back into managed code: a managed callee runs in a
    /// nested interpreter loop that ends when its frame returns. The callee and its
    /// arguments are consumed whether the call succeeds or fails.
    pub fn call_stack(&mut self, argc: usize) -> RunResult<Value> {
        let out_slots = self.thread.stack.len() - argc - 1;
        let callee = self.thread.stack[out_slots];
        self.call_nested(callee, argc, out_slots)
    }

    /// Calls `callee` with `args` and returns its result.
    pub fn call_direct(&mut self, callee: Value, args: &[Value]) -> RunResult<Value> {
        self.push(callee);
        self.thread.stack.extend_from_slice(args);
        self.call_stack(args.len())
    }

    fn call_nested(&mut self, callee: Value, argc: usize, out_slots: usize) -> RunResult<Value> {
        let result = match self.call_at(callee, argc, out_slots) {
            Ok(CallResult::Push(value)) => Ok(value),
            Ok(CallResult::FramePushed) => {
                let depth = self.thread.frames.len() - 1;
                match self.run(depth) {
                    Ok(FrameExit::Return(value)) => Ok(value),
                    Ok(FrameExit::Yield(_)) => Err(RunError::internal("frame yielded outside a generator")),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.thread.stack.truncate(out_slots);
        }
        result
    }

    // ========================================================================
    // Closures
    // ========================================================================

    fn call_closure(&mut self, closure: HeapId, argc: usize, out_slots: usize) -> RunResult<CallResult> {
        let code = self.heap.closure(closure).code;
        self.bind_arguments(code, argc)?;
        let slots = self.thread.stack.len() - self.heap.code(code).argument_slots();

        if self.heap.code(code).is_generator() {
            let arguments = self.thread.stack[slots..].to_vec();
            let generator = self.new_generator(closure, arguments)?;
            self.thread.stack.truncate(out_slots);
            return Ok(CallResult::Push(Value::Ref(generator)));
        }

        self.push_frame(closure, slots, out_slots)?;
        Ok(CallResult::FramePushed)
    }

    /// Pushes a frame for `closure` whose arguments start at stack index `slots`.
    pub(crate) fn push_frame(&mut self, closure: HeapId, slots: usize, out_slots: usize) -> RunResult<()> {
        self.heap.tracker().check_recursion_depth(self.thread.frames.len())?;
        let data = self.heap.closure(closure);
        let frame = CallFrame {
            closure,
            code: data.code,
            ip: 0,
            slots,
            out_slots,
            globals: data.globals,
        };
        self.thread.frames.push(frame);
        let name = self.heap.code(frame.code).name.map(|id| self.heap.str(id));
        self.tracer.on_call(name, self.thread.frames.len());
        Ok(())
    }

    /// Whether the top `argc` values end with a keyword count marker.
    fn has_complex_arguments(&self, argc: usize) -> bool {
        argc > 0 && matches!(self.peek(0), Value::Kwargs(count) if count != KWARGS_UNSET && count < KWARGS_DICT)
    }

    /// Rewrites the top `argc` values into the parameter slots of `code`.
    ///
    /// Afterwards the stack holds exactly `argument_slots()` values for the callee:
    /// positional parameters, the `*args` tuple, keyword-only parameters and the
    /// `**kwargs` dict. Optional parameters the caller left out hold `Kwargs(0)`.
    fn bind_arguments(&mut self, code_id: HeapId, argc: usize) -> RunResult<()> {
        let complex = self.has_complex_arguments(argc);
        let code = self.heap.code(code_id);
        let total = code.argument_slots();

        if !complex
            && !code.flags.intersects(CodeFlags::COLLECTS_ARGS | CodeFlags::COLLECTS_KWARGS)
            && (code.required_args..=code.positional_names.len()).contains(&argc)
            && code.keyword_only.iter().all(|k| !k.required)
        {
            for _ in argc..total {
                self.push(Value::Kwargs(KWARGS_UNSET));
            }
            return Ok(());
        }

        self.with_gc_paused(|vm| vm.bind_arguments_slow(code_id, argc, complex))
    }

    fn bind_arguments_slow(&mut self, code_id: HeapId, argc: usize, complex: bool) -> RunResult<()> {
        let base = self.thread.stack.len() - argc;
        let CallArgs { positional, keywords } = if complex {
            self.decode_arguments(argc)?
        } else {
            CallArgs {
                positional: self.thread.stack[base..].to_vec(),
                keywords: Vec::new(),
            }
        };

        let code = self.heap.code(code_id);
        let name = self.code_name(code_id);
        let names = code.positional_names.clone();
        let keyword_only = code.keyword_only.clone();
        let required = code.required_args;
        let kw_start = code.keyword_only_start();
        let args_slot = code.args_slot();
        let kwargs_slot = code.kwargs_slot();
        let mut slots = vec![Value::Kwargs(KWARGS_UNSET); code.argument_slots()];

        if positional.len() > names.len() && args_slot.is_none() {
            return Err(too_many_positional(&name, required, names.len(), positional.len()));
        }
        let direct = positional.len().min(names.len());
        slots[..direct].copy_from_slice(&positional[..direct]);
        if let Some(slot) = args_slot {
            slots[slot] = self.new_tuple(positional[direct..].to_vec())?;
        }
        let kwargs = match kwargs_slot {
            Some(slot) => {
                let dict = self.new_dict()?;
                slots[slot] = dict;
                Some(dict)
            }
            None => None,
        };

        for (key, value) in keywords {
            let Some(key_id) = key
                .as_heap_id()
                .filter(|&id| matches!(self.heap.get(id), HeapData::Str(_)))
            else {
                return Err(ExcType::type_error(format!("{name}() keywords must be strings")));
            };
            // parameter names are interned, so identity is equality
            let target = names.iter().position(|&n| n == key_id).or_else(|| {
                keyword_only
                    .iter()
                    .position(|k| k.name == key_id)
                    .map(|j| kw_start + j)
            });
            match (target, kwargs) {
                (Some(index), _) => {
                    if !slots[index].is_unset() {
                        return Err(multiple_values(&name, self.heap.str(key_id)));
                    }
                    slots[index] = value;
                }
                (None, Some(dict)) => {
                    if self.dict_get(dict, key)?.is_some() {
                        return Err(multiple_values(&name, self.heap.str(key_id)));
                    }
                    self.dict_set(dict, key, value)?;
                }
                (None, None) => {
                    return Err(ExcType::type_error(format!(
                        "{name}() got an unexpected keyword argument '{}'",
                        self.heap.str(key_id)
                    )));
                }
            }
        }

        let missing: Vec<&str> = (0..required)
            .filter(|&i| slots[i].is_unset())
            .map(|i| self.heap.str(names[i]))
            .collect();
        if !missing.is_empty() {
            return Err(missing_arguments(&name, "positional", &missing));
        }
        let missing: Vec<&str> = keyword_only
            .iter()
            .enumerate()
            .filter(|&(j, k)| k.required && slots[kw_start + j].is_unset())
            .map(|(_, k)| self.heap.str(k.name))
            .collect();
        if !missing.is_empty() {
            return Err(missing_arguments(&name, "keyword-only", &missing));
        }

        self.thread.stack.truncate(base);
        self.thread.stack.extend(slots);
        Ok(())
    }

    /// Decodes the top `argc` values of a call ending in a keyword count marker.
    ///
    /// `*iterable` expansions are flattened into the positional list and `**mapping`
    /// expansions into the keyword list, in call order. Must run with collection
    /// paused: the decoded values are only held in Rust.
    fn decode_arguments(&mut self, argc: usize) -> RunResult<CallArgs> {
        let base = self.thread.stack.len() - argc;
        let Value::Kwargs(count) = self.peek(0) else {
            return Err(RunError::internal("call has no keyword count marker"));
        };
        let pairs = count as usize;
        let pair_start = (argc - 1)
            .checked_sub(pairs * 2)
            .map(|start| base + start)
            .ok_or_else(|| RunError::internal("keyword count exceeds argument count"))?;

        let mut positional = self.thread.stack[base..pair_start].to_vec();
        let raw: SmallVec<[Value; 8]> = SmallVec::from_slice(&self.thread.stack[pair_start..self.thread.stack.len() - 1]);
        let mut keywords = Vec::new();
        for pair in raw.chunks_exact(2) {
            let (marker, value) = (pair[0], pair[1]);
            match marker {
                Value::Kwargs(KWARGS_SINGLE) => positional.push(value),
                Value::Kwargs(KWARGS_LIST) => positional.extend(self.collect_iterable(value)?),
                Value::Kwargs(KWARGS_DICT) => {
                    let Some(entries) = self.dict_entries(value) else {
                        return Err(ExcType::type_error(format!(
                            "argument after ** must be a mapping, not {}",
                            self.heap.type_name(value)
                        )));
                    };
                    keywords.extend(entries);
                }
                name => keywords.push((name, value)),
            }
        }
        Ok(CallArgs { positional, keywords })
    }

    /// Name of a function for error messages.
    pub(crate) fn code_name(&self, code: HeapId) -> String {
        self.heap
            .code(code)
            .name
            .map_or_else(|| "<unnamed function>".to_owned(), |id| self.heap.str(id).to_owned())
    }

    // ========================================================================
    // Natives
    // ========================================================================

    fn call_native(&mut self, target: NativeTarget, argc: usize, out_slots: usize) -> RunResult<CallResult> {
        let (argc, has_kw) = if self.has_complex_arguments(argc) {
            self.with_gc_paused(|vm| vm.flatten_native_arguments(argc))?
        } else {
            (argc, false)
        };

        // the originals stay on the stack, keeping the arguments reachable
        let args: SmallVec<[Value; 8]> = SmallVec::from_slice(self.top_values(argc));
        let result = match target {
            NativeTarget::Builtin(builtin) => builtins::call_builtin(self, builtin, &args, has_kw)?,
            NativeTarget::Host(index) => {
                let function = self.host_functions[index];
                function(self, &args, has_kw)?
            }
        };
        self.thread.stack.truncate(out_slots);
        Ok(CallResult::Push(result))
    }

    /// Replaces a call's keyword and expansion encoding with plain positional values
    /// followed by a dict of the keywords, if there were any.
    ///
    /// Returns the new argument count and whether the dict was pushed.
    fn flatten_native_arguments(&mut self, argc: usize) -> RunResult<(usize, bool)> {
        let base = self.thread.stack.len() - argc;
        let CallArgs { positional, keywords } = self.decode_arguments(argc)?;
        let kwargs = if keywords.is_empty() {
            None
        } else {
            let dict = self.new_dict()?;
            for (key, value) in keywords {
                self.dict_set(dict, key, value)?;
            }
            Some(dict)
        };
        self.thread.stack.truncate(base);
        self.thread.stack.extend(positional);
        if let Some(dict) = kwargs {
            self.push(dict);
        }
        Ok((self.thread.stack.len() - base, kwargs.is_some()))
    }

    // ========================================================================
    // Classes
    // ========================================================================

    /// Instantiates `class`: `__new__` if the class has one, else a fresh instance
    /// passed through `__init__`.
    fn call_class(&mut self, class: HeapId, argc: usize, out_slots: usize) -> RunResult<CallResult> {
        if let Some(constructor) = self.heap.class(class).special(SpecialMethod::New) {
            self.insert_receiver(argc, Value::Ref(class));
            return self.call_at(constructor, argc + 1, out_slots);
        }

        let init = self.heap.class(class).special(SpecialMethod::Init);
        let instance = self.new_instance(class)?;
        self.thread.stack[out_slots] = Value::Ref(instance);

        match init {
            Some(init) => {
                self.insert_receiver(argc, Value::Ref(instance));
                let result = self.call_nested(init, argc + 1, out_slots + 1)?;
                if !result.is_none() {
                    return Err(ExcType::type_error(format!(
                        "__init__() should return None, not '{}'",
                        self.heap.type_name(result)
                    )));
                }
            }
            None if argc > 0 => {
                return Err(ExcType::type_error(format!(
                    "{}() takes no arguments",
                    self.heap.str(self.heap.class(class).name)
                )));
            }
            None => {}
        }
        self.thread.stack.truncate(out_slots);
        Ok(CallResult::Push(Value::Ref(instance)))
    }

    /// Key/value pairs of a dict instance, or `None` if `value` is not one.
    pub(crate) fn dict_entries(&self, value: Value) -> Option<Vec<(Value, Value)>> {
        match &self.heap.instance(value.as_heap_id()?)?.payload {
            Payload::Dict(table) => Some(table.iter().collect()),
            _ => None,
        }
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 { "" } else { "s" }
}

fn too_many_positional(name: &str, required: usize, max: usize, given: usize) -> RunError {
    let takes = if required == max {
        format!("{max} positional argument{}", plural(max))
    } else {
        format!("from {required} to {max} positional arguments")
    };
    let were = if given == 1 { "was" } else { "were" };
    ExcType::type_error(format!("{name}() takes {takes} but {given} {were} given"))
}

fn multiple_values(name: &str, argument: &str) -> RunError {
    ExcType::type_error(format!("{name}() got multiple values for argument '{argument}'"))
}

fn missing_arguments(name: &str, kind: &str, missing: &[&str]) -> RunError {
    ExcType::type_error(format!(
        "{name}() missing {} required {kind} argument{}: {}",
        missing.len(),
        plural(missing.len()),
        format_param_names(missing)
    ))
}
